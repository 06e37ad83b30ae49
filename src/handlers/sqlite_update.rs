//! `sqlite_update` request handler: mutates the persistent per-system
//! store. The request path is `<prefix>/<system_id>`; the system id both
//! gates access control and addresses the row(s) being written.

use super::{access_check, decode_path, AccessDecision, Handler, HandlerError, Method, Request, Response};
use crate::data_tree::Value;
use crate::store::SqliteStore;
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
	DeleteData,
	SetValue,
	SetJsonValueFromRequestBody,
	SetTextValueFromRequestBody,
}

pub struct SqliteUpdateHandlerConfig {
	pub request_path: String,
	pub action: Action,
	pub key: String,
	pub value: Option<Value>,
	pub client_address_key: Option<String>,
	pub client_address_list: Vec<String>,
}

pub struct SqliteUpdateHandler {
	request_path: String,
	action: Action,
	key: String,
	value: Option<Value>,
	client_address_key: Option<String>,
	client_address_list: Vec<String>,
	store: SqliteStore,
}

impl SqliteUpdateHandler {
	pub fn new(config: SqliteUpdateHandlerConfig, store: SqliteStore) -> Self {
		Self {
			request_path: config.request_path,
			action: config.action,
			key: config.key,
			value: config.value,
			client_address_key: config.client_address_key,
			client_address_list: config.client_address_list,
			store,
		}
	}

	fn prefix(&self) -> &str {
		self.request_path.trim_end_matches('/')
	}
}

#[async_trait]
impl Handler for SqliteUpdateHandler {
	fn can_handle(&self, request: &Request) -> bool {
		if !matches!(request.method, Method::Post) {
			return false;
		}
		match decode_path(&request.path) {
			Ok(decoded) => decoded.starts_with(self.prefix()),
			Err(_) => false,
		}
	}

	async fn handle(&self, request: &Request) -> Result<Response, HandlerError> {
		let decoded = decode_path(&request.path)?;
		let system_id = decoded
			.strip_prefix(self.prefix())
			.map(|s| s.trim_start_matches('/'))
			.filter(|s| !s.is_empty())
			.ok_or(HandlerError::NotFound)?
			.to_string();

		let existing = self
			.store
			.iter_system(&system_id)
			.map_err(|e| HandlerError::Internal(e.to_string()))?;
		let mut data = Value::empty_map();
		for (key, value) in existing {
			data.set_path(&key, value);
		}

		match access_check(
			self.client_address_key.as_deref(),
			&self.client_address_list,
			&data,
			request.client_address,
		) {
			AccessDecision::Permitted => {}
			AccessDecision::Denied => return Err(HandlerError::AccessDenied),
			// Access control is configured but there is nothing in the
			// system's data to evaluate it against: per spec section 4.4,
			// that is indistinguishable from the system not resolving.
			AccessDecision::Unresolvable => return Err(HandlerError::NotFound),
		}

		match self.action {
			Action::DeleteData => {
				self.store
					.delete(&system_id, &self.key)
					.map_err(|e| HandlerError::Internal(e.to_string()))?;
			}
			Action::SetValue => {
				let value = self
					.value
					.clone()
					.ok_or_else(|| HandlerError::Internal("set_value action requires a configured value".into()))?;
				self.store
					.set(&system_id, &self.key, &value)
					.map_err(|e| HandlerError::Internal(e.to_string()))?;
			}
			Action::SetJsonValueFromRequestBody => {
				let json: serde_json::Value = serde_json::from_slice(&request.body)
					.map_err(|e| HandlerError::BadRequest(format!("malformed JSON body: {}", e)))?;
				self.store
					.set(&system_id, &self.key, &Value::from(json))
					.map_err(|e| HandlerError::Internal(e.to_string()))?;
			}
			Action::SetTextValueFromRequestBody => {
				let text = String::from_utf8(request.body.clone())
					.map_err(|_| HandlerError::BadRequest("request body is not valid UTF-8".into()))?;
				self.store
					.set(&system_id, &self.key, &Value::String(text))
					.map_err(|e| HandlerError::Internal(e.to_string()))?;
			}
		}

		Ok(Response::no_content())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	fn request(path: &str, client: &str, body: &[u8]) -> Request {
		Request {
			method: Method::Post,
			path: path.to_string(),
			client_address: client.parse().unwrap(),
			headers: HashMap::new(),
			body: body.to_vec(),
		}
	}

	#[tokio::test]
	async fn delete_data_with_matching_client_address() {
		let store = SqliteStore::open_in_memory().unwrap();
		store
			.set("myhost.example.com", "net:ipv4_addr", &Value::String("192.0.2.1".into()))
			.unwrap();
		store.set("myhost.example.com", "netboot_enabled", &Value::Bool(true)).unwrap();

		let handler = SqliteUpdateHandler::new(
			SqliteUpdateHandlerConfig {
				request_path: "/reset-netboot-enabled/".into(),
				action: Action::DeleteData,
				key: "netboot_enabled".into(),
				value: None,
				client_address_key: Some("net:ipv4_addr".into()),
				client_address_list: Vec::new(),
			},
			store.clone(),
		);

		let req = request("/reset-netboot-enabled/myhost.example.com", "192.0.2.1", b"");
		let response = handler.handle(&req).await.unwrap();
		assert_eq!(response.status, 204);
		assert_eq!(store.get("myhost.example.com", "netboot_enabled").unwrap(), None);
	}

	#[tokio::test]
	async fn access_denied_for_mismatched_client_address() {
		let store = SqliteStore::open_in_memory().unwrap();
		store
			.set("myhost.example.com", "net:ipv4_addr", &Value::String("192.0.2.1".into()))
			.unwrap();
		store.set("myhost.example.com", "netboot_enabled", &Value::Bool(true)).unwrap();

		let handler = SqliteUpdateHandler::new(
			SqliteUpdateHandlerConfig {
				request_path: "/reset-netboot-enabled/".into(),
				action: Action::DeleteData,
				key: "netboot_enabled".into(),
				value: None,
				client_address_key: Some("net:ipv4_addr".into()),
				client_address_list: Vec::new(),
			},
			store.clone(),
		);

		let req = request("/reset-netboot-enabled/myhost.example.com", "192.0.2.2", b"");
		let err = handler.handle(&req).await.unwrap_err();
		assert!(matches!(err, HandlerError::AccessDenied));
		assert_eq!(store.get("myhost.example.com", "netboot_enabled").unwrap(), Some(Value::Bool(true)));
	}

	#[tokio::test]
	async fn not_found_when_access_control_configured_but_system_has_no_rows() {
		let store = SqliteStore::open_in_memory().unwrap();

		let handler = SqliteUpdateHandler::new(
			SqliteUpdateHandlerConfig {
				request_path: "/reset-netboot-enabled/".into(),
				action: Action::DeleteData,
				key: "netboot_enabled".into(),
				value: None,
				client_address_key: Some("net:ipv4_addr".into()),
				client_address_list: Vec::new(),
			},
			store.clone(),
		);

		let req = request("/reset-netboot-enabled/unknown.example.com", "192.0.2.1", b"");
		let err = handler.handle(&req).await.unwrap_err();
		assert!(matches!(err, HandlerError::NotFound));
	}

	#[tokio::test]
	async fn set_json_value_rejects_malformed_body() {
		let store = SqliteStore::open_in_memory().unwrap();
		let handler = SqliteUpdateHandler::new(
			SqliteUpdateHandlerConfig {
				request_path: "/set-config/".into(),
				action: Action::SetJsonValueFromRequestBody,
				key: "config".into(),
				value: None,
				client_address_key: None,
				client_address_list: Vec::new(),
			},
			store,
		);

		let req = request("/set-config/myhost.example.com", "192.0.2.1", b"{not json");
		let err = handler.handle(&req).await.unwrap_err();
		assert!(matches!(err, HandlerError::BadRequest(_)));
	}
}
