#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use courier_domain::{ClientId, ConnId, UserId};
use courier_protocol::{ClientFrame, LoginFrame, RawFrame, ResponseFrame, encode, kind, parse_frame, status};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::{Instant, interval_at, timeout};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info, warn};

use crate::config::ClientSettings;
use crate::server::auth::Authenticator;
use crate::server::hub::Hub;
use crate::server::outbound::{OutboundQueue, OutboundReceiver};
use crate::server::registry::ConnectionHandle;
use crate::util::net::accept_retrying;

/// Per-connection limits and keepalive timers.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub read_message_size_limit: usize,
	pub read_buffer_size: usize,
	pub write_buffer_size: usize,
	pub queue_capacity: usize,
	pub enqueue_timeout: Duration,
	pub ping_period: Duration,
	pub pong_wait: Duration,
	pub write_wait: Duration,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		ClientSettings::default().into()
	}
}

impl From<ClientSettings> for ConnectionSettings {
	fn from(c: ClientSettings) -> Self {
		Self {
			read_message_size_limit: c.read_message_size_limit,
			read_buffer_size: c.read_buffer_size,
			write_buffer_size: c.write_buffer_size,
			queue_capacity: c.queue_capacity,
			enqueue_timeout: c.enqueue_timeout,
			ping_period: c.ping_period,
			pong_wait: c.pong_wait,
			write_wait: c.write_wait,
		}
	}
}

impl ConnectionSettings {
	pub(crate) fn websocket_config(&self) -> WebSocketConfig {
		WebSocketConfig::default()
			.read_buffer_size(self.read_buffer_size.max(1))
			.write_buffer_size(self.write_buffer_size)
			.max_message_size(Some(self.read_message_size_limit))
			.max_frame_size(Some(self.read_message_size_limit))
	}
}

/// Accept WebSocket clients for the life of the process.
pub async fn serve_ws(listener: TcpListener, hub: Hub, auth: Arc<Authenticator>, settings: ConnectionSettings) {
	let next_conn_id = AtomicU64::new(1);
	let listener = &listener;

	loop {
		let (stream, remote) = accept_retrying("websocket", move || listener.accept()).await;
		let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
		metrics::counter!("courier_connections_total").increment(1);

		let hub = hub.clone();
		let auth = Arc::clone(&auth);
		let settings = settings.clone();
		tokio::spawn(async move {
			let ws = match tokio_tungstenite::accept_async_with_config(stream, Some(settings.websocket_config())).await {
				Ok(ws) => ws,
				Err(e) => {
					warn!(conn_id, %remote, error = %e, "websocket handshake failed");
					return;
				}
			};
			info!(conn_id, %remote, "accepted connection");

			if let Err(e) = handle_connection(conn_id, ws, hub, auth, settings).await {
				warn!(conn_id, error = %e, "connection handler exited with error");
			}
		});
	}
}

/// Drive one client connection: a writer task owns the sink, this task reads
/// frames and runs the protocol state machine.
pub async fn handle_connection<S>(
	conn_id: ConnId,
	ws: WebSocketStream<S>,
	hub: Hub,
	auth: Arc<Authenticator>,
	settings: ConnectionSettings,
) -> anyhow::Result<()>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("courier_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("courier_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (sink, mut stream) = ws.split();
	let (queue, outbound) = OutboundQueue::new(settings.queue_capacity, settings.enqueue_timeout);

	let mut writer = tokio::spawn(run_writer(
		conn_id,
		sink,
		outbound,
		settings.ping_period,
		settings.write_wait,
	));
	let mut writer_done = false;

	let mut session = Session::new(conn_id, hub.clone(), auth, queue.clone());

	let result = loop {
		tokio::select! {
			read = timeout(settings.pong_wait, stream.next()) => {
				let msg = match read {
					Err(_) => {
						info!(conn_id, "liveness timeout");
						break Ok(());
					}
					Ok(None) => break Ok(()),
					Ok(Some(Err(e))) => {
						debug!(conn_id, error = %e, "read failed");
						break Err(anyhow::Error::new(e).context("websocket read"));
					}
					Ok(Some(Ok(msg))) => msg,
				};

				match msg {
					Message::Text(text) => session.handle_text(text.as_str()).await,
					Message::Close(frame) => {
						debug!(conn_id, ?frame, "peer closed");
						break Ok(());
					}
					// Pings are answered by the codec; any frame counts as liveness.
					Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
					Message::Binary(_) => debug!(conn_id, "ignoring binary frame"),
				}
			}
			_ = &mut writer, if !writer_done => {
				writer_done = true;
				debug!(conn_id, "writer stopped");
				break Ok(());
			}
		}
	};

	hub.unregister(conn_id);
	queue.close();

	if !writer_done && timeout(settings.write_wait, &mut writer).await.is_err() {
		writer.abort();
	}

	info!(conn_id, user = ?session.user(), "connection closed");
	result
}

async fn run_writer<K>(
	conn_id: ConnId,
	mut sink: K,
	mut outbound: OutboundReceiver,
	ping_period: Duration,
	write_wait: Duration,
) where
	K: futures::Sink<Message> + Unpin,
	K::Error: std::fmt::Display,
{
	let mut ticker = interval_at(Instant::now() + ping_period, ping_period);

	loop {
		let msg = tokio::select! {
			biased;
			frame = outbound.frames.recv() => match frame {
				Some(text) => Message::text(text),
				None => break,
			},
			_ = outbound.closed.wait_for(|closed| *closed) => break,
			_ = ticker.tick() => Message::Ping(Default::default()),
		};

		match timeout(write_wait, sink.send(msg)).await {
			Ok(Ok(())) => {}
			Ok(Err(e)) => {
				debug!(conn_id, error = %e, "write failed");
				return;
			}
			Err(_) => {
				debug!(conn_id, "write timed out");
				return;
			}
		}
	}

	// Queue closed: say goodbye before the transport goes away.
	let _ = timeout(write_wait, sink.send(Message::Close(None))).await;
	let _ = timeout(write_wait, sink.close()).await;
}

/// Protocol state of one connection.
pub(crate) struct Session {
	conn_id: ConnId,
	identity: Option<(UserId, ClientId)>,
	hub: Hub,
	auth: Arc<Authenticator>,
	queue: OutboundQueue,
}

impl Session {
	pub(crate) fn new(conn_id: ConnId, hub: Hub, auth: Arc<Authenticator>, queue: OutboundQueue) -> Self {
		Self {
			conn_id,
			identity: None,
			hub,
			auth,
			queue,
		}
	}

	pub(crate) fn user(&self) -> Option<&UserId> {
		self.identity.as_ref().map(|(u, _)| u)
	}

	/// Handle one inbound text frame. Malformed JSON is dropped; any failure
	/// while handling a parsed frame is answered with an `e` frame.
	pub(crate) async fn handle_text(&mut self, text: &str) {
		metrics::counter!("courier_frames_in_total").increment(1);

		let raw = match parse_frame(text) {
			Ok(raw) => raw,
			Err(e) => {
				warn!(conn_id = self.conn_id, error = %e, "dropping malformed frame");
				return;
			}
		};

		if let Err(e) = self.dispatch(&raw).await {
			warn!(conn_id = self.conn_id, kind = %raw.kind, id = %raw.id, error = %e, "frame handling failed");
			self.send(&ResponseFrame::error(&raw.kind, &raw.id, format!("{e:#}"))).await;
		}
	}

	async fn dispatch(&mut self, raw: &RawFrame) -> anyhow::Result<()> {
		let Some((user, _)) = self.identity.clone() else {
			if raw.kind != kind::LOGIN {
				self.reply(raw, status::AUTH, "").await;
				return Ok(());
			}
			return match raw.decode()? {
				ClientFrame::Login(login) => self.login(raw, login).await,
				_ => Ok(()),
			};
		};

		match raw.decode()? {
			ClientFrame::Login(_) => {
				self.reply(raw, status::FAIL, "already logged in").await;
			}
			ClientFrame::Tag(changes) => {
				self.hub.update_tags(&user, &changes).await?;
				self.reply(raw, status::OK, "").await;
			}
			ClientFrame::Ack(ids) => {
				self.hub.acknowledge(&user, &ids).await?;
			}
			ClientFrame::Unknown(other) => {
				debug!(conn_id = self.conn_id, kind = %other, "ignoring unknown frame type");
			}
		}
		Ok(())
	}

	async fn login(&mut self, raw: &RawFrame, login: LoginFrame) -> anyhow::Result<()> {
		let Some((user, client_id)) = login.identity() else {
			self.reply(raw, status::FAIL, "no user or clientid").await;
			return Ok(());
		};

		if let Err(e) = self.auth.verify_login(&login) {
			info!(conn_id = self.conn_id, user = %user, client_id = %client_id, error = %e, "login rejected");
			self.reply(raw, status::AUTH, "").await;
			return Ok(());
		}

		self.identity = Some((user.clone(), client_id.clone()));
		info!(conn_id = self.conn_id, user = %user, client_id = %client_id, "login");
		self.reply(raw, status::OK, client_id.as_str()).await;

		self.hub
			.register(ConnectionHandle {
				conn_id: self.conn_id,
				user,
				client_id,
				queue: self.queue.clone(),
			})
			.await;
		Ok(())
	}

	async fn reply(&self, raw: &RawFrame, code: u16, message: &str) {
		self.send(&ResponseFrame::reply(&raw.kind, &raw.id, code, message)).await;
	}

	async fn send(&self, frame: &ResponseFrame) {
		let text = match encode(frame) {
			Ok(t) => t,
			Err(e) => {
				warn!(conn_id = self.conn_id, error = %e, "encode response failed");
				return;
			}
		};
		if let Err(e) = self.queue.enqueue(text).await {
			warn!(conn_id = self.conn_id, error = %e, "response dropped");
		}
	}
}
