//! `file` request handler: resolves a system id from the request path,
//! fetches its merged data tree, then either streams a file from disk or
//! renders it through the template engine.

use super::{
	access_check, decode_path, request_info_tree, safe_join, strip_prefix, AccessDecision, DataSourceErrorAction,
	Handler, HandlerError, LookupNoResultAction, Method, Request, Response,
};
use crate::data_tree::Value;
use crate::sources::CompositeDataSource;
use crate::template::{Engine, TemplateContext};
use crate::transforms::TransformChain;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

const SYSTEM_ID_SENTINEL: &str = ":system_id:";

pub struct FileHandler {
	request_path: String,
	root_dir: PathBuf,
	lookup_key: Option<String>,
	lookup_value_transform: TransformChain,
	template: Option<PathBuf>,
	data_source_error_action: DataSourceErrorAction,
	lookup_no_result_action: LookupNoResultAction,
	client_address_key: Option<String>,
	client_address_list: Vec<String>,
	file_suffix: Option<String>,
	composite: Arc<CompositeDataSource>,
	engine: Arc<dyn Engine>,
}

pub struct FileHandlerConfig {
	pub request_path: String,
	pub root_dir: PathBuf,
	pub lookup_key: Option<String>,
	pub lookup_value_transform: TransformChain,
	pub template: Option<PathBuf>,
	pub data_source_error_action: DataSourceErrorAction,
	pub lookup_no_result_action: LookupNoResultAction,
	pub client_address_key: Option<String>,
	pub client_address_list: Vec<String>,
	pub file_suffix: Option<String>,
}

impl FileHandler {
	pub fn new(config: FileHandlerConfig, composite: Arc<CompositeDataSource>, engine: Arc<dyn Engine>) -> Self {
		Self {
			request_path: config.request_path,
			root_dir: config.root_dir,
			lookup_key: config.lookup_key,
			lookup_value_transform: config.lookup_value_transform,
			template: config.template,
			data_source_error_action: config.data_source_error_action,
			lookup_no_result_action: config.lookup_no_result_action,
			client_address_key: config.client_address_key,
			client_address_list: config.client_address_list,
			file_suffix: config.file_suffix,
			composite,
			engine,
		}
	}

	fn prefix_literal(&self) -> &str {
		self.request_path.strip_suffix('…').unwrap_or(&self.request_path)
	}

	/// Steps 3-4 of the algorithm: resolve a system id (or decide to
	/// proceed with `id=absent, data=absent`), returning the merged data
	/// tree alongside it.
	async fn resolve_system(&self, lookup_value: Option<&str>) -> Result<(Option<String>, Value), HandlerError> {
		let system_id = match (&self.lookup_key, lookup_value) {
			(Some(key), Some(value)) if key == SYSTEM_ID_SENTINEL => Some(value.to_string()),
			(Some(key), Some(value)) => {
				let normalized = self
					.lookup_value_transform
					.apply(Value::String(value.to_string()))
					.map_err(|e| HandlerError::BadRequest(e.to_string()))?;
				let normalized = normalized
					.as_scalar_string()
					.ok_or_else(|| HandlerError::BadRequest("lookup_value_transform produced a non-scalar value".into()))?;
				match self.composite.find_system(key, &normalized).await {
					Ok(found) => found,
					Err(e) => match self.data_source_error_action {
						DataSourceErrorAction::Fail => return Err(HandlerError::Internal(e.to_string())),
						DataSourceErrorAction::Warn => {
							warn!(error = %e, "data source error during reverse lookup, treating as no system");
							None
						}
						DataSourceErrorAction::Continue => None,
					},
				}
			}
			_ => None,
		};

		let system_id = match system_id {
			Some(id) => Some(id),
			None if lookup_value.is_some() && self.lookup_key.is_some() => {
				match self.lookup_no_result_action {
					LookupNoResultAction::Fail => return Err(HandlerError::NotFound),
					LookupNoResultAction::Continue => None,
				}
			}
			None => None,
		};

		let data = match &system_id {
			Some(id) => match self.composite.get_data(id).await {
				Ok((tree, _versions)) => tree,
				Err(e) => match self.data_source_error_action {
					DataSourceErrorAction::Fail => return Err(HandlerError::Internal(e.to_string())),
					DataSourceErrorAction::Warn => {
						warn!(error = %e, "data source error fetching data tree, proceeding with absent data");
						Value::empty_map()
					}
					DataSourceErrorAction::Continue => Value::empty_map(),
				},
			},
			None => Value::empty_map(),
		};

		Ok((system_id, data))
	}
}

#[async_trait]
impl Handler for FileHandler {
	fn can_handle(&self, request: &Request) -> bool {
		if !matches!(request.method, Method::Get | Method::Head) {
			return false;
		}
		match decode_path(&request.path) {
			Ok(decoded) => decoded.starts_with(self.prefix_literal()),
			Err(_) => false,
		}
	}

	async fn handle(&self, request: &Request) -> Result<Response, HandlerError> {
		let decoded = decode_path(&request.path)?;
		let (lookup_value, subpath) =
			strip_prefix(&self.request_path, &decoded).ok_or_else(|| HandlerError::NotFound)?;

		let (id, data) = self.resolve_system(lookup_value.as_deref()).await?;

		// A system that genuinely didn't resolve (no lookup configured, or
		// the `continue` fallback from an unresolved lookup) has no data to
		// check access control against and is let through per spec.md §9's
		// "id absent" behaviour; a *resolved* system whose data happens to
		// lack the configured `client_address_key` must not silently pass.
		if id.is_some() {
			match access_check(
				self.client_address_key.as_deref(),
				&self.client_address_list,
				&data,
				request.client_address,
			) {
				AccessDecision::Permitted => {}
				AccessDecision::Denied | AccessDecision::Unresolvable => return Err(HandlerError::AccessDenied),
			}
		}

		let mut candidate = safe_join(&self.root_dir, &subpath)?;
		if let Some(suffix) = &self.file_suffix {
			let mut name = candidate.into_os_string();
			name.push(suffix);
			candidate = PathBuf::from(name);
		}

		let metadata = std::fs::metadata(&candidate).map_err(|_| HandlerError::NotFound)?;
		if !metadata.is_file() {
			return Err(HandlerError::NotFound);
		}

		match &self.template {
			None => Ok(Response::file(candidate, metadata.len())),
			Some(template_path) => {
				let context = TemplateContext::new(id, data).with_request_info(request_info_tree(request));
				let rendered = self.engine.render(template_path, &context).map_err(|e| {
					if matches!(e, crate::template::TemplateError::NotFound(_)) {
						HandlerError::NotFound
					} else {
						HandlerError::Internal(e.to_string())
					}
				})?;
				Ok(Response::bytes(rendered))
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::sources::composite::CompositeDataSource as Composite;
	use crate::template::engine::DefaultEngine;
	use std::collections::HashMap;
	use std::io::Write;

	fn request(path: &str) -> Request {
		Request {
			method: Method::Get,
			path: path.to_string(),
			client_address: "192.0.2.1".parse().unwrap(),
			headers: HashMap::new(),
			body: Vec::new(),
		}
	}

	#[tokio::test]
	async fn streams_static_file_by_direct_system_id() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("myhost.example.com"), b"hello world").unwrap();

		let composite = Arc::new(Composite::new(Vec::new(), false));
		let engine = Arc::new(DefaultEngine::new());
		let handler = FileHandler::new(
			FileHandlerConfig {
				request_path: "/files/…".into(),
				root_dir: dir.path().to_path_buf(),
				lookup_key: Some(":system_id:".into()),
				lookup_value_transform: TransformChain::default(),
				template: None,
				data_source_error_action: DataSourceErrorAction::Fail,
				lookup_no_result_action: LookupNoResultAction::Fail,
				client_address_key: None,
				client_address_list: Vec::new(),
				file_suffix: None,
			},
			composite,
			engine,
		);

		let req = request("/files/myhost.example.com");
		assert!(handler.can_handle(&req));
		let response = handler.handle(&req).await.unwrap();
		match response.body {
			super::super::Body::File { len, .. } => assert_eq!(len, 11),
			_ => panic!("expected a file body"),
		}
	}

	#[tokio::test]
	async fn rejects_path_traversal() {
		let dir = tempfile::tempdir().unwrap();
		let composite = Arc::new(Composite::new(Vec::new(), false));
		let engine = Arc::new(DefaultEngine::new());
		let handler = FileHandler::new(
			FileHandlerConfig {
				request_path: "/files/".into(),
				root_dir: dir.path().to_path_buf(),
				lookup_key: None,
				lookup_value_transform: TransformChain::default(),
				template: None,
				data_source_error_action: DataSourceErrorAction::Fail,
				lookup_no_result_action: LookupNoResultAction::Fail,
				client_address_key: None,
				client_address_list: Vec::new(),
				file_suffix: None,
			},
			composite,
			engine,
		);

		let req = request("/files/../../etc/passwd");
		let err = handler.handle(&req).await.unwrap_err();
		assert!(matches!(err, HandlerError::BadRequest(_)));
	}

	#[tokio::test]
	async fn renders_template_with_id_absent_on_continue() {
		let dir = tempfile::tempdir().unwrap();
		let template_path = dir.path().join("local_boot.tmpl");
		let mut f = std::fs::File::create(&template_path).unwrap();
		write!(f, "{{% if id %}}boot {{{{ id }}}}{{% else %}}local boot{{% endif %}}").unwrap();

		let composite = Arc::new(Composite::new(Vec::new(), false));
		let engine = Arc::new(DefaultEngine::new());
		let handler = FileHandler::new(
			FileHandlerConfig {
				request_path: "/boot/…".into(),
				root_dir: dir.path().to_path_buf(),
				lookup_key: Some("net:mac_addr".into()),
				lookup_value_transform: TransformChain::default(),
				template: Some(template_path),
				data_source_error_action: DataSourceErrorAction::Warn,
				lookup_no_result_action: LookupNoResultAction::Continue,
				client_address_key: None,
				client_address_list: Vec::new(),
				file_suffix: None,
			},
			composite,
			engine,
		);

		let req = request("/boot/00-11-22-33-44-55/grub.cfg");
		let response = handler.handle(&req).await.unwrap();
		match response.body {
			super::super::Body::Bytes(bytes) => assert_eq!(bytes, b"local boot"),
			_ => panic!("expected rendered bytes"),
		}
	}

	#[tokio::test]
	async fn denies_resolved_system_missing_configured_access_key() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("myhost.example.com"), b"hello world").unwrap();

		let composite = Arc::new(Composite::new(Vec::new(), false));
		let engine = Arc::new(DefaultEngine::new());
		let handler = FileHandler::new(
			FileHandlerConfig {
				request_path: "/files/…".into(),
				root_dir: dir.path().to_path_buf(),
				lookup_key: Some(":system_id:".into()),
				lookup_value_transform: TransformChain::default(),
				template: None,
				data_source_error_action: DataSourceErrorAction::Fail,
				lookup_no_result_action: LookupNoResultAction::Fail,
				client_address_key: Some("net:ipv4_addr".into()),
				client_address_list: Vec::new(),
				file_suffix: None,
			},
			composite,
			engine,
		);

		// The system id resolves (it's the sentinel, taken straight from
		// the path), but nothing in the composite's empty source list ever
		// populates `net:ipv4_addr`, so access control has nothing to
		// check against and must deny rather than silently pass through.
		let req = request("/files/myhost.example.com");
		let err = handler.handle(&req).await.unwrap_err();
		assert!(matches!(err, HandlerError::AccessDenied));
	}
}
