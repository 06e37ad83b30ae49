//! TFTP server: RFC 1350 read requests with the RFC 2347/2348/2349 option
//! extensions (`blksize`, `timeout`, `tsize`). Write requests are always
//! rejected. Each accepted read request gets its own ephemeral, connected
//! UDP socket, which gives us the transfer-id check for free: a connected
//! socket only ever yields datagrams from its peer, so a stray packet from
//! another address is simply never delivered to `recv`.

use crate::handlers::{Body, Handler, HandlerError, Method, Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const OP_RRQ: u16 = 1;
const OP_WRQ: u16 = 2;
const OP_DATA: u16 = 3;
const OP_ACK: u16 = 4;
const OP_ERROR: u16 = 5;
const OP_OACK: u16 = 6;

const DEFAULT_BLKSIZE: u16 = 512;
const DEFAULT_TIMEOUT_SECS: u8 = 5;
const MIN_BLKSIZE: u32 = 8;
const MAX_BLKSIZE: u32 = 65464;
const MIN_TIMEOUT: u32 = 1;
const MAX_TIMEOUT: u32 = 255;

#[derive(Debug, Error)]
pub enum TftpError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
	#[error("malformed packet")]
	Malformed,
	#[error("timed out waiting for peer")]
	Timeout,
	#[error("client aborted: code {0} ({1})")]
	ClientAborted(u16, String),
}

pub struct TftpServerConfig {
	pub bind_address: SocketAddr,
	pub max_retries: u32,
}

pub struct TftpServer {
	config: TftpServerConfig,
	handlers: Vec<Arc<dyn Handler>>,
}

impl TftpServer {
	pub fn new(config: TftpServerConfig, handlers: Vec<Arc<dyn Handler>>) -> Self {
		Self { config, handlers }
	}

	pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), TftpError> {
		let socket = UdpSocket::bind(self.config.bind_address).await?;
		info!(address = %self.config.bind_address, "TFTP server listening");
		let handlers = Arc::new(self.handlers);
		let max_retries = self.config.max_retries;
		let mut buf = vec![0u8; 65536];

		loop {
			tokio::select! {
				_ = shutdown.changed() => {
					info!("TFTP server shutting down");
					return Ok(());
				}
				received = socket.recv_from(&mut buf) => {
					let (n, peer) = received?;
					let datagram = buf[..n].to_vec();
					let handlers = Arc::clone(&handlers);
					tokio::spawn(async move {
						if let Err(e) = serve_transfer(peer, datagram, &handlers, max_retries).await {
							debug!(peer = %peer, error = %e, "TFTP transfer ended");
						}
					});
				}
			}
		}
	}
}

struct ReadRequest {
	filename: String,
	mode: String,
	options: Vec<(String, String)>,
}

fn read_cstr(buf: &[u8], mut pos: usize) -> Option<(String, usize)> {
	let start = pos;
	while pos < buf.len() && buf[pos] != 0 {
		pos += 1;
	}
	if pos >= buf.len() {
		return None;
	}
	let s = String::from_utf8_lossy(&buf[start..pos]).into_owned();
	Some((s, pos + 1))
}

fn parse_request(buf: &[u8]) -> Result<ReadRequest, TftpError> {
	if buf.len() < 4 {
		return Err(TftpError::Malformed);
	}
	let (filename, pos) = read_cstr(buf, 2).ok_or(TftpError::Malformed)?;
	let (mode, mut pos) = read_cstr(buf, pos).ok_or(TftpError::Malformed)?;
	let mut options = Vec::new();
	while pos < buf.len() {
		let (name, next) = read_cstr(buf, pos).ok_or(TftpError::Malformed)?;
		let (value, next2) = read_cstr(buf, next).ok_or(TftpError::Malformed)?;
		options.push((name.to_ascii_lowercase(), value));
		pos = next2;
	}
	Ok(ReadRequest {
		filename,
		mode: mode.to_ascii_lowercase(),
		options,
	})
}

fn build_data(block: u16, chunk: &[u8]) -> Vec<u8> {
	let mut packet = Vec::with_capacity(4 + chunk.len());
	packet.extend_from_slice(&OP_DATA.to_be_bytes());
	packet.extend_from_slice(&block.to_be_bytes());
	packet.extend_from_slice(chunk);
	packet
}

fn build_error(code: u16, message: &str) -> Vec<u8> {
	let mut packet = Vec::with_capacity(5 + message.len());
	packet.extend_from_slice(&OP_ERROR.to_be_bytes());
	packet.extend_from_slice(&code.to_be_bytes());
	packet.extend_from_slice(message.as_bytes());
	packet.push(0);
	packet
}

fn build_oack(options: &[(String, String)]) -> Vec<u8> {
	let mut packet = Vec::new();
	packet.extend_from_slice(&OP_OACK.to_be_bytes());
	for (name, value) in options {
		packet.extend_from_slice(name.as_bytes());
		packet.push(0);
		packet.extend_from_slice(value.as_bytes());
		packet.push(0);
	}
	packet
}

/// Clamp requested options to the ranges RFC 2348/2349 allow, keeping only
/// the subset the peer actually asked for. `windowsize` and anything
/// unrecognized is silently left out of the OACK, which per RFC 2347 means
/// "not accepted, fall back to the unextended behaviour".
fn negotiate_options(requested: &[(String, String)], content_len: u64) -> (u16, u8, Vec<(String, String)>) {
	let mut blksize = DEFAULT_BLKSIZE;
	let mut timeout = DEFAULT_TIMEOUT_SECS;
	let mut accepted = Vec::new();
	for (name, value) in requested {
		match name.as_str() {
			"blksize" => {
				if let Ok(v) = value.parse::<u32>() {
					let clamped = v.clamp(MIN_BLKSIZE, MAX_BLKSIZE) as u16;
					blksize = clamped;
					accepted.push(("blksize".to_string(), clamped.to_string()));
				}
			}
			"timeout" => {
				if let Ok(v) = value.parse::<u32>() {
					let clamped = v.clamp(MIN_TIMEOUT, MAX_TIMEOUT) as u8;
					timeout = clamped;
					accepted.push(("timeout".to_string(), clamped.to_string()));
				}
			}
			"tsize" => {
				accepted.push(("tsize".to_string(), content_len.to_string()));
			}
			_ => {}
		}
	}
	(blksize, timeout, accepted)
}

enum RecvOutcome {
	Ack(u16),
	Error(u16, String),
}

async fn recv_ack_or_error(socket: &UdpSocket) -> Result<RecvOutcome, TftpError> {
	let mut buf = [0u8; 65536];
	loop {
		let n = socket.recv(&mut buf).await?;
		if n < 2 {
			continue;
		}
		let opcode = u16::from_be_bytes([buf[0], buf[1]]);
		match opcode {
			OP_ACK if n >= 4 => {
				let block = u16::from_be_bytes([buf[2], buf[3]]);
				return Ok(RecvOutcome::Ack(block));
			}
			OP_ERROR if n >= 4 => {
				let code = u16::from_be_bytes([buf[2], buf[3]]);
				let (message, _) = read_cstr(&buf[..n], 4).unwrap_or_default();
				return Ok(RecvOutcome::Error(code, message));
			}
			_ => continue,
		}
	}
}

/// Decode an ERROR packet's code for logging. Codes 0-7 are the ones RFC
/// 1350 defines; anything else is logged as unknown rather than panicking
/// on an out-of-range match.
fn log_client_error(code: u16, message: &str) {
	if code <= 7 {
		debug!(code, message, "peer reported a TFTP error");
	} else {
		warn!("unknown error code {}: {}", code, message);
	}
}

async fn send_and_wait_ack(
	socket: &UdpSocket,
	packet: &[u8],
	expected_block: u16,
	timeout_secs: u8,
	max_retries: u32,
) -> Result<(), TftpError> {
	let mut attempts = 0;
	loop {
		socket.send(packet).await?;
		match tokio::time::timeout(Duration::from_secs(timeout_secs as u64), recv_ack_or_error(socket)).await {
			Ok(Ok(RecvOutcome::Ack(block))) => {
				if block == expected_block {
					return Ok(());
				}
				continue;
			}
			Ok(Ok(RecvOutcome::Error(code, message))) => {
				return Err(TftpError::ClientAborted(code, message));
			}
			Ok(Err(e)) => return Err(e),
			Err(_elapsed) => {
				attempts += 1;
				if attempts >= max_retries {
					return Err(TftpError::Timeout);
				}
				continue;
			}
		}
	}
}

async fn bind_ephemeral(peer: SocketAddr) -> Result<UdpSocket, TftpError> {
	let local: SocketAddr = if peer.is_ipv4() {
		"0.0.0.0:0".parse().unwrap()
	} else {
		"[::]:0".parse().unwrap()
	};
	let socket = UdpSocket::bind(local).await?;
	socket.connect(peer).await?;
	Ok(socket)
}

async fn reply_error_from_main_socket(peer: SocketAddr, code: u16, message: &str) -> Result<(), TftpError> {
	let socket = bind_ephemeral(peer).await?;
	socket.send(&build_error(code, message)).await?;
	Ok(())
}

async fn fetch_content(handlers: &[Arc<dyn Handler>], filename: &str, peer: SocketAddr) -> Result<Vec<u8>, HandlerError> {
	let request = Request {
		method: Method::Get,
		path: format!("/{}", filename.trim_start_matches('/')),
		client_address: peer.ip(),
		headers: Default::default(),
		body: Vec::new(),
	};
	for handler in handlers {
		if handler.can_handle(&request) {
			let response = handler.handle(&request).await?;
			return match response.body {
				Body::Bytes(bytes) => Ok(bytes),
				Body::File { path, .. } => tokio::fs::read(&path)
					.await
					.map_err(|e| HandlerError::Internal(e.to_string())),
				Body::Empty => Ok(Vec::new()),
			};
		}
	}
	Err(HandlerError::NotFound)
}

async fn serve_transfer(
	peer: SocketAddr,
	datagram: Vec<u8>,
	handlers: &[Arc<dyn Handler>],
	max_retries: u32,
) -> Result<(), TftpError> {
	if datagram.len() < 2 {
		return Err(TftpError::Malformed);
	}
	let opcode = u16::from_be_bytes([datagram[0], datagram[1]]);

	if opcode == OP_WRQ {
		reply_error_from_main_socket(peer, 2, "write requests are not supported").await?;
		return Ok(());
	}
	if opcode != OP_RRQ {
		return Err(TftpError::Malformed);
	}

	let request = parse_request(&datagram)?;
	if request.mode != "octet" && request.mode != "netascii" {
		reply_error_from_main_socket(peer, 0, "unsupported transfer mode, use octet or netascii").await?;
		return Ok(());
	}

	let content = match fetch_content(handlers, &request.filename, peer).await {
		Ok(bytes) => bytes,
		Err(e) => {
			reply_error_from_main_socket(peer, e.tftp_code(), &e.to_string()).await?;
			return Ok(());
		}
	};

	let socket = bind_ephemeral(peer).await?;
	let (blksize, timeout, accepted) = negotiate_options(&request.options, content.len() as u64);

	if !accepted.is_empty() {
		let oack = build_oack(&accepted);
		match send_and_wait_ack(&socket, &oack, 0, timeout, max_retries).await {
			Ok(()) => {}
			Err(TftpError::ClientAborted(code, message)) => {
				debug!(peer = %peer, code, message, "client aborted during option negotiation");
				return Ok(());
			}
			Err(e) => return Err(e),
		}
	}

	let mut block: u16 = 1;
	let mut offset = 0usize;
	let blksize = blksize as usize;
	loop {
		let end = (offset + blksize).min(content.len());
		let chunk = &content[offset..end];
		let packet = build_data(block, chunk);
		match send_and_wait_ack(&socket, &packet, block, timeout, max_retries).await {
			Ok(()) => {}
			Err(TftpError::ClientAborted(code, message)) => {
				log_client_error(code, &message);
				return Ok(());
			}
			Err(e) => return Err(e),
		}
		let is_last = chunk.len() < blksize;
		offset = end;
		if is_last {
			break;
		}
		block = block.wrapping_add(1);
	}

	Ok(())
}
