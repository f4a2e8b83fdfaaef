#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::time::Duration;

use courier_domain::unix_secs_now;
use courier_protocol::frames::client;
use courier_protocol::{DigestAlgorithm, ServerFrame, kind, status, token_digest};
use courier_util::endpoint::Endpoint;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

pub mod admin;

/// Errors for client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	/// Endpoint could not be parsed.
	#[error("invalid endpoint: {0}")]
	Endpoint(String),

	/// Connection establishment failed.
	#[error("failed to connect: {0}")]
	Connect(String),

	/// Transport failure after connecting.
	#[error("websocket error: {0}")]
	WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

	/// The node answered with a non-OK status.
	#[error("rejected by node (code {code}): {message}")]
	Rejected { code: u16, message: String },

	/// Unexpected frame or timeout.
	#[error("protocol error: {0}")]
	Protocol(String),
}

/// Connection parameters for one client session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Node WebSocket endpoint (`ws://host:port`).
	pub endpoint: Endpoint,
	pub user: String,
	pub client_id: String,
	/// Shared token secret.
	pub secret: String,
	pub digest: DigestAlgorithm,
	/// Bound on connect and on waiting for each correlated response.
	pub timeout: Duration,
}

impl ClientConfig {
	pub fn new(endpoint: &str, user: &str, client_id: &str, secret: &str) -> Result<Self, ClientError> {
		Ok(Self {
			endpoint: Endpoint::parse_ws(endpoint).map_err(ClientError::Endpoint)?,
			user: user.to_string(),
			client_id: client_id.to_string(),
			secret: secret.to_string(),
			digest: DigestAlgorithm::default(),
			timeout: Duration::from_secs(10),
		})
	}
}

/// An open WebSocket session with a node.
pub struct ClientSession {
	ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
	// Frames read while waiting for a correlated response.
	pending: VecDeque<ServerFrame>,
	next_id: u64,
	timeout: Duration,
}

impl ClientSession {
	/// Open the WebSocket without logging in.
	pub async fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<Self, ClientError> {
		let url = endpoint.url();
		let (ws, _resp) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str()))
			.await
			.map_err(|_| ClientError::Connect(format!("connect timeout after {timeout:?} ({url})")))?
			.map_err(|e| ClientError::Connect(format!("{url}: {e}")))?;
		info!(%url, "connected");

		Ok(Self {
			ws,
			pending: VecDeque::new(),
			next_id: 1,
			timeout,
		})
	}

	/// Connect and log in with a token computed from `cfg.secret`.
	pub async fn connect_and_login(cfg: &ClientConfig) -> Result<Self, ClientError> {
		let mut session = Self::connect(&cfg.endpoint, cfg.timeout).await?;
		let ts = unix_secs_now();
		let token = token_digest(cfg.digest, &cfg.secret, &cfg.user, &cfg.client_id, ts);
		session.login(&cfg.user, &cfg.client_id, &token, ts).await?;
		Ok(session)
	}

	fn next_request_id(&mut self) -> String {
		let id = self.next_id;
		self.next_id += 1;
		id.to_string()
	}

	/// Send a login frame and wait for its response.
	pub async fn login(&mut self, user: &str, client_id: &str, token: &str, ts: i64) -> Result<ServerFrame, ClientError> {
		let id = self.next_request_id();
		self.send_text(client::login(&id, user, client_id, token, ts)).await?;
		let resp = self.expect_ok(&id).await?;
		debug!(user, client_id, "logged in");
		Ok(resp)
	}

	/// Apply `(tag, add?)` changes and wait for the confirmation.
	pub async fn update_tags(&mut self, changes: &[(String, bool)]) -> Result<ServerFrame, ClientError> {
		let id = self.next_request_id();
		self.send_text(client::tags(&id, changes)).await?;
		self.expect_ok(&id).await
	}

	/// Acknowledge message ids. The node does not answer acks.
	pub async fn ack(&mut self, message_ids: &[String]) -> Result<(), ClientError> {
		if message_ids.is_empty() {
			return Ok(());
		}
		let id = self.next_request_id();
		self.send_text(client::ack(&id, message_ids)).await
	}

	/// Send a raw text frame.
	pub async fn send_text(&mut self, text: String) -> Result<(), ClientError> {
		self.ws.send(Message::text(text)).await?;
		Ok(())
	}

	/// Next frame from the node; `None` once the connection is closed.
	pub async fn next_frame(&mut self) -> Result<Option<ServerFrame>, ClientError> {
		if let Some(frame) = self.pending.pop_front() {
			return Ok(Some(frame));
		}
		self.read_frame().await
	}

	/// Like `next_frame`, bounded by `wait`.
	pub async fn next_frame_within(&mut self, wait: Duration) -> Result<Option<ServerFrame>, ClientError> {
		tokio::time::timeout(wait, self.next_frame())
			.await
			.map_err(|_| ClientError::Protocol(format!("no frame within {wait:?}")))?
	}

	async fn read_frame(&mut self) -> Result<Option<ServerFrame>, ClientError> {
		while let Some(msg) = self.ws.next().await {
			match msg? {
				Message::Text(text) => {
					let frame: ServerFrame = serde_json::from_str(text.as_str())
						.map_err(|e| ClientError::Protocol(format!("undecodable frame: {e}")))?;
					return Ok(Some(frame));
				}
				Message::Close(_) => return Ok(None),
				_ => {}
			}
		}
		Ok(None)
	}

	/// Wait for the `r`/`e` frame correlated with `id`, keeping any other
	/// frames for `next_frame`.
	pub async fn expect_response(&mut self, id: &str) -> Result<ServerFrame, ClientError> {
		let wait = self.timeout;
		tokio::time::timeout(wait, self.read_until_reply(id))
			.await
			.map_err(|_| ClientError::Protocol(format!("no response to request {id} within {wait:?}")))?
	}

	async fn read_until_reply(&mut self, id: &str) -> Result<ServerFrame, ClientError> {
		loop {
			let Some(frame) = self.read_frame().await? else {
				return Err(ClientError::Protocol("connection closed".to_string()));
			};
			let is_reply = (frame.t == kind::RESPONSE || frame.t == kind::ERROR) && frame.i.as_deref() == Some(id);
			if is_reply {
				return Ok(frame);
			}
			self.pending.push_back(frame);
		}
	}

	async fn expect_ok(&mut self, id: &str) -> Result<ServerFrame, ClientError> {
		let resp = self.expect_response(id).await?;
		match resp.c {
			Some(status::OK) if resp.t == kind::RESPONSE => Ok(resp),
			code => Err(ClientError::Rejected {
				code: code.unwrap_or_default(),
				message: resp.m.clone().unwrap_or_default(),
			}),
		}
	}

	/// Send a Close frame and drain until the node hangs up.
	pub async fn close(mut self) -> Result<(), ClientError> {
		self.ws.close(None).await?;
		while let Some(Ok(_)) = self.ws.next().await {}
		Ok(())
	}
}

/// Parse `a,-b` into `[("a", true), ("b", false)]`. Blank entries are skipped.
pub fn parse_tag_changes(s: &str) -> Vec<(String, bool)> {
	s.split(',')
		.map(str::trim)
		.filter(|t| !t.is_empty())
		.filter_map(|t| match t.strip_prefix('-') {
			Some(rest) => {
				let rest = rest.trim();
				(!rest.is_empty()).then(|| (rest.to_string(), false))
			}
			None => Some((t.to_string(), true)),
		})
		.collect()
}
