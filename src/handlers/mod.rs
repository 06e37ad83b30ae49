//! Request handlers: the protocol-agnostic core shared by the HTTP and
//! TFTP servers. Each server owns its own ordered `Vec<Arc<dyn Handler>>`
//! and offers every incoming request to each handler in turn; the first
//! handler whose `can_handle` returns true owns the request, with no
//! fallback to the next one.

pub mod file;
pub mod sqlite_update;

use crate::data_tree::Value;
use crate::transforms::ip_address::subnet_contains;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use file::{FileHandler, FileHandlerConfig};
pub use sqlite_update::{Action, SqliteUpdateHandler, SqliteUpdateHandlerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
	Get,
	Head,
	Post,
}

/// A request as seen by a handler, independent of which server protocol
/// received it. TFTP requests carry an empty header map and body.
#[derive(Debug, Clone)]
pub struct Request {
	pub method: Method,
	pub path: String,
	pub client_address: IpAddr,
	pub headers: HashMap<String, String>,
	pub body: Vec<u8>,
}

/// What a handler produced, in a form each server can stream on its own
/// terms (HTTP emits Content-Length from either variant; TFTP only ever
/// deals in complete in-memory buffers since it has no streaming body type).
#[derive(Debug)]
pub enum Body {
	File { path: PathBuf, len: u64 },
	Bytes(Vec<u8>),
	Empty,
}

#[derive(Debug)]
pub struct Response {
	pub status: u16,
	pub body: Body,
	pub content_type: Option<String>,
}

impl Response {
	pub fn file(path: PathBuf, len: u64) -> Self {
		Self {
			status: 200,
			body: Body::File { path, len },
			content_type: None,
		}
	}

	pub fn bytes(bytes: Vec<u8>) -> Self {
		Self {
			status: 200,
			body: Body::Bytes(bytes),
			content_type: None,
		}
	}

	pub fn no_content() -> Self {
		Self {
			status: 204,
			body: Body::Empty,
			content_type: None,
		}
	}
}

#[derive(Debug, Error)]
pub enum HandlerError {
	#[error("not found")]
	NotFound,
	#[error("access denied")]
	AccessDenied,
	#[error("bad request: {0}")]
	BadRequest(String),
	#[error("internal error: {0}")]
	Internal(String),
}

impl HandlerError {
	/// HTTP status code per the error taxonomy in section 7.
	pub fn http_status(&self) -> u16 {
		match self {
			HandlerError::NotFound => 404,
			HandlerError::AccessDenied => 403,
			HandlerError::BadRequest(_) => 400,
			HandlerError::Internal(_) => 500,
		}
	}

	/// TFTP ERROR opcode code: 1 "file not found", 2 "access violation",
	/// 4 "illegal TFTP operation" (malformed request), 0 "not defined".
	pub fn tftp_code(&self) -> u16 {
		match self {
			HandlerError::NotFound => 1,
			HandlerError::AccessDenied => 2,
			HandlerError::BadRequest(_) => 4,
			HandlerError::Internal(_) => 0,
		}
	}
}

/// A request handler claims requests by path prefix and produces a
/// response, optionally by resolving a system through the composite data
/// source and rendering a template against its data tree.
#[async_trait]
pub trait Handler: Send + Sync {
	fn can_handle(&self, request: &Request) -> bool;

	async fn handle(&self, request: &Request) -> Result<Response, HandlerError>;
}

/// Error action for a data-source failure encountered while resolving a
/// system, per the file-handler `data_source_error_action` config key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataSourceErrorAction {
	#[default]
	Fail,
	Warn,
	Continue,
}

/// What to do when the lookup succeeded (no data-source error) but found
/// no matching system, per `lookup_no_result_action`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LookupNoResultAction {
	#[default]
	Fail,
	Continue,
}

/// Percent-decode a request path and reject backslashes outright; `..`
/// and absolute-path traversal are caught later by `safe_join`, once the
/// path has been split into a prefix and subpath.
pub fn decode_path(raw: &str) -> Result<String, HandlerError> {
	let decoded = urlencoding::decode(raw)
		.map_err(|e| HandlerError::BadRequest(format!("invalid percent-encoding: {}", e)))?
		.into_owned();
	if decoded.contains('\\') {
		return Err(HandlerError::BadRequest("backslash in path is not allowed".into()));
	}
	Ok(decoded)
}

/// Join `subpath` onto `root`, rejecting any component that would escape
/// `root` (`..`, an absolute path, or a Windows-style drive prefix).
pub fn safe_join(root: &Path, subpath: &str) -> Result<PathBuf, HandlerError> {
	let mut result = root.to_path_buf();
	for component in Path::new(subpath).components() {
		match component {
			std::path::Component::Normal(part) => result.push(part),
			std::path::Component::CurDir => {}
			std::path::Component::ParentDir => {
				return Err(HandlerError::BadRequest("path traversal is not allowed".into()));
			}
			std::path::Component::RootDir | std::path::Component::Prefix(_) => {
				return Err(HandlerError::BadRequest("absolute path is not allowed".into()));
			}
		}
	}
	Ok(result)
}

/// Strip a configured `request_path` prefix from a decoded request path.
/// If the prefix ends in `…`, the next path segment is peeled off as the
/// *lookup value* and the remainder is the subpath; otherwise the whole
/// remainder after the literal prefix is the subpath.
pub fn strip_prefix(request_path: &str, decoded_path: &str) -> Option<(Option<String>, String)> {
	if let Some(literal) = request_path.strip_suffix('…') {
		let rest = decoded_path.strip_prefix(literal)?;
		let rest = rest.trim_start_matches('/');
		let (lookup_value, subpath) = match rest.split_once('/') {
			Some((first, tail)) => (first, tail),
			None => (rest, ""),
		};
		if lookup_value.is_empty() {
			return None;
		}
		Some((Some(lookup_value.to_string()), subpath.to_string()))
	} else {
		let rest = decoded_path.strip_prefix(request_path)?;
		Some((None, rest.trim_start_matches('/').to_string()))
	}
}

/// Outcome of an access-control check. `Unresolvable` is distinct from
/// `Denied`: it means access control *was* configured but there was
/// nothing to check the client address against (a configured
/// `client_address_key` whose value is absent from the system's data,
/// with no `client_address_list` to fall back on) -- the caller, not
/// this function, decides whether that maps to "access denied" or
/// "not found" per its own error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
	Permitted,
	Denied,
	Unresolvable,
}

/// The union of `client_address_list` and the value at `client_address_key`
/// (if configured and present), matched against `client_address` either
/// exactly or as subnet membership when a candidate carries a `/n` mask.
/// Per the spec's open question on precedence, either matching admits.
/// Neither key nor list configured means access control is not in use:
/// permit. Configured but yielding zero candidates (key absent, list
/// empty) means access control cannot be evaluated at all.
pub fn access_check(
	client_address_key: Option<&str>,
	client_address_list: &[String],
	data: &Value,
	client_address: IpAddr,
) -> AccessDecision {
	if client_address_key.is_none() && client_address_list.is_empty() {
		return AccessDecision::Permitted;
	}
	let mut candidates: Vec<String> = client_address_list.to_vec();
	if let Some(key) = client_address_key {
		if let Some(value) = data.lookup(key).and_then(|v| v.as_scalar_string()) {
			candidates.push(value);
		}
	}
	if candidates.is_empty() {
		return AccessDecision::Unresolvable;
	}
	let client_str = client_address.to_string();
	let matched = candidates.iter().any(|candidate| {
		if candidate.contains('/') {
			subnet_contains(candidate, &client_str)
		} else {
			candidate == &client_str
		}
	});
	if matched {
		AccessDecision::Permitted
	} else {
		AccessDecision::Denied
	}
}

/// The `{id, data, request_info}` request_info half of the template scope:
/// method, client address, and headers, independent of protocol.
pub fn request_info_tree(request: &Request) -> Value {
	let mut tree = Value::empty_map();
	tree.set_path("method", Value::String(method_name(request.method).to_string()));
	tree.set_path("client_address", Value::String(request.client_address.to_string()));
	let mut headers = Value::empty_map();
	for (k, v) in &request.headers {
		headers.set_path(k, Value::String(v.clone()));
	}
	tree.set_path("headers", headers);
	tree
}

fn method_name(method: Method) -> &'static str {
	match method {
		Method::Get => "GET",
		Method::Head => "HEAD",
		Method::Post => "POST",
	}
}
