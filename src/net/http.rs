//! HTTP/1.1 server: a thin transport shim over the shared `Handler`
//! pipeline. Built on hyper's low-level `http1` connection driver rather
//! than a full framework, since routing here is just "first handler whose
//! `can_handle` matches" -- there is no need for a router crate.

use crate::handlers::{Body as HandlerBody, Handler, HandlerError, Method as HandlerMethod, Request as HandlerRequest, Response as HandlerResponse};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body as _;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request as HyperRequest, Response as HyperResponse, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Request bodies larger than this are rejected with 413 before the
/// handler pipeline ever sees them.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub struct HttpServerConfig {
	pub bind_address: SocketAddr,
}

pub struct HttpServer {
	config: HttpServerConfig,
	handlers: Arc<Vec<Arc<dyn Handler>>>,
}

impl HttpServer {
	pub fn new(config: HttpServerConfig, handlers: Vec<Arc<dyn Handler>>) -> Self {
		Self {
			config,
			handlers: Arc::new(handlers),
		}
	}

	pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), std::io::Error> {
		let listener = TcpListener::bind(self.config.bind_address).await?;
		info!(address = %self.config.bind_address, "HTTP server listening");

		loop {
			tokio::select! {
				_ = shutdown.changed() => {
					info!("HTTP server shutting down");
					return Ok(());
				}
				accepted = listener.accept() => {
					let (stream, peer) = accepted?;
					let handlers = Arc::clone(&self.handlers);
					let mut conn_shutdown = shutdown.clone();
					tokio::spawn(async move {
						let io = TokioIo::new(stream);
						let service = service_fn(move |req| {
							let handlers = Arc::clone(&handlers);
							async move { Ok::<_, Infallible>(dispatch(req, peer, handlers).await) }
						});
						let conn = http1::Builder::new().serve_connection(io, service);
						tokio::pin!(conn);
						tokio::select! {
							result = &mut conn => {
								if let Err(e) = result {
									debug!(peer = %peer, error = %e, "HTTP connection ended with an error");
								}
							}
							_ = conn_shutdown.changed() => {
								conn.as_mut().graceful_shutdown();
								if let Err(e) = conn.await {
									debug!(peer = %peer, error = %e, "HTTP connection ended during graceful shutdown");
								}
							}
						}
					});
				}
			}
		}
	}
}

fn to_handler_method(method: &hyper::Method) -> Option<HandlerMethod> {
	match *method {
		hyper::Method::GET => Some(HandlerMethod::Get),
		hyper::Method::HEAD => Some(HandlerMethod::Head),
		hyper::Method::POST => Some(HandlerMethod::Post),
		_ => None,
	}
}

async fn dispatch(
	req: HyperRequest<Incoming>,
	peer: SocketAddr,
	handlers: Arc<Vec<Arc<dyn Handler>>>,
) -> HyperResponse<Full<Bytes>> {
	let Some(method) = to_handler_method(req.method()) else {
		return status_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
	};

	let path = req.uri().path().to_string();
	let mut headers = HashMap::new();
	for (name, value) in req.headers() {
		if let Ok(v) = value.to_str() {
			headers.insert(name.to_string(), v.to_string());
		}
	}

	if let Some(len) = req
		.headers()
		.get(hyper::header::CONTENT_LENGTH)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.parse::<usize>().ok())
	{
		if len > MAX_BODY_BYTES {
			return status_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
		}
	}

	let body_method = method;
	let body = match req.into_body().collect().await {
		Ok(collected) => collected.to_bytes(),
		Err(e) => {
			warn!(error = %e, "failed to read request body");
			return status_response(StatusCode::BAD_REQUEST, "failed to read request body");
		}
	};
	if body.len() > MAX_BODY_BYTES {
		return status_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
	}

	let request = HandlerRequest {
		method: body_method,
		path,
		client_address: peer.ip(),
		headers,
		body: body.to_vec(),
	};

	for handler in handlers.iter() {
		if handler.can_handle(&request) {
			return match handler.handle(&request).await {
				Ok(response) => build_response(response, method),
				Err(e) => error_response(e),
			};
		}
	}

	status_response(StatusCode::NOT_FOUND, "no handler matched this request")
}

fn build_response(response: HandlerResponse, method: HandlerMethod) -> HyperResponse<Full<Bytes>> {
	let is_head = matches!(method, HandlerMethod::Head);
	let (bytes, content_len) = match response.body {
		HandlerBody::Bytes(b) => {
			let len = b.len() as u64;
			(if is_head { Bytes::new() } else { Bytes::from(b) }, len)
		}
		HandlerBody::File { path, len } => {
			if is_head {
				(Bytes::new(), len)
			} else {
				match std::fs::read(&path) {
					Ok(contents) => {
						let len = contents.len() as u64;
						(Bytes::from(contents), len)
					}
					Err(e) => {
						error!(path = %path.display(), error = %e, "failed to read file body after metadata stat succeeded");
						return error_response(HandlerError::Internal(e.to_string()));
					}
				}
			}
		}
		HandlerBody::Empty => (Bytes::new(), 0),
	};

	let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK);
	let mut builder = HyperResponse::builder().status(status).header(hyper::header::CONTENT_LENGTH, content_len);
	if let Some(ct) = response.content_type {
		builder = builder.header(hyper::header::CONTENT_TYPE, ct);
	}
	builder.body(Full::new(bytes)).unwrap_or_else(|_| status_response(StatusCode::INTERNAL_SERVER_ERROR, "response build failed"))
}

fn error_response(error: HandlerError) -> HyperResponse<Full<Bytes>> {
	let status = StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
	status_response(status, &error.to_string())
}

fn status_response(status: StatusCode, message: &str) -> HyperResponse<Full<Bytes>> {
	let body = Bytes::from(message.to_string());
	HyperResponse::builder()
		.status(status)
		.header(hyper::header::CONTENT_LENGTH, body.len())
		.header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
		.body(Full::new(body))
		.expect("building a fixed status response cannot fail")
}
