#![forbid(unsafe_code)]

use std::time::Duration;

use courier_domain::unix_secs_now;
use courier_protocol::frames::client;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::Role;

use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::hub::Hub;
use crate::server::test_support::{authenticator, hub_with_store, user};

type Peer = WebSocketStream<DuplexStream>;

fn timers(ping_ms: u64, pong_ms: u64, write_ms: u64) -> ConnectionSettings {
	ConnectionSettings {
		ping_period: Duration::from_millis(ping_ms),
		pong_wait: Duration::from_millis(pong_ms),
		write_wait: Duration::from_millis(write_ms),
		..ConnectionSettings::default()
	}
}

/// Serve one connection over an in-memory socket of `buffer` bytes and return
/// the client end.
async fn serve(hub: &Hub, settings: ConnectionSettings, buffer: usize) -> (Peer, JoinHandle<anyhow::Result<()>>) {
	let (server_io, client_io) = tokio::io::duplex(buffer);
	let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
	let peer = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
	let task = tokio::spawn(handle_connection(1, server, hub.clone(), authenticator(), settings));
	(peer, task)
}

async fn login(peer: &mut Peer, u: &str, c: &str) -> Value {
	let ts = unix_secs_now();
	let token = authenticator().login_token(u, c, ts);
	peer.send(Message::text(client::login("1", u, c, &token, ts))).await.unwrap();

	loop {
		let msg = timeout(Duration::from_secs(1), peer.next())
			.await
			.expect("reply within timeout")
			.expect("connection open")
			.unwrap();
		if let Message::Text(text) = msg {
			return serde_json::from_str(text.as_str()).unwrap();
		}
	}
}

async fn wait_for_connections(hub: &Hub, n: usize) {
	timeout(Duration::from_secs(1), async {
		while hub.registry().connection_count() != n {
			sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.expect("registry reached expected size");
}

#[tokio::test]
async fn idle_connection_receives_pings() {
	let (hub, _store) = hub_with_store();
	let (mut peer, task) = serve(&hub, timers(20, 2_000, 1_000), 64 * 1024).await;

	let msg = timeout(Duration::from_secs(1), peer.next())
		.await
		.expect("ping within timeout")
		.expect("connection open")
		.unwrap();
	assert!(matches!(msg, Message::Ping(_)), "{msg:?}");

	task.abort();
}

#[tokio::test]
async fn silent_peer_is_dropped_after_pong_wait_and_unregistered() {
	let (hub, _store) = hub_with_store();
	let (mut peer, task) = serve(&hub, timers(20, 300, 1_000), 64 * 1024).await;

	assert_eq!(login(&mut peer, "alice", "phone").await["c"], 200);
	wait_for_connections(&hub, 1).await;

	// Stop reading: no pongs go back, so the node sees silence.
	let result = timeout(Duration::from_secs(3), task)
		.await
		.expect("connection ends after pong_wait")
		.unwrap();
	assert!(result.is_ok(), "{result:?}");
	assert_eq!(hub.registry().connection_count(), 0);
	assert!(hub.registry().lookup_by_user(&user("alice")).is_empty());
}

#[tokio::test]
async fn inbound_frames_keep_the_connection_alive() {
	let (hub, _store) = hub_with_store();
	let (mut peer, task) = serve(&hub, timers(1_000, 150, 1_000), 64 * 1024).await;

	assert_eq!(login(&mut peer, "bob", "phone").await["c"], 200);
	for _ in 0..6 {
		sleep(Duration::from_millis(50)).await;
		peer.send(Message::Pong(Default::default())).await.unwrap();
	}
	assert!(!task.is_finished());
	assert_eq!(hub.registry().connection_count(), 1);

	task.abort();
}

#[tokio::test]
async fn stalled_writes_end_the_connection_after_write_wait() {
	let (hub, _store) = hub_with_store();
	// A tiny socket buffer that nobody drains: pings soon block the writer.
	let (_peer, task) = serve(&hub, timers(5, 10_000, 50), 64).await;

	let result = timeout(Duration::from_secs(3), task)
		.await
		.expect("connection ends once a write stalls past write_wait")
		.unwrap();
	assert!(result.is_ok(), "{result:?}");
}

#[test]
fn websocket_config_carries_buffer_and_size_limits() {
	let settings = ConnectionSettings {
		read_message_size_limit: 512,
		read_buffer_size: 1024,
		write_buffer_size: 2048,
		..ConnectionSettings::default()
	};
	let cfg = settings.websocket_config();
	assert_eq!(cfg.read_buffer_size, 1024);
	assert_eq!(cfg.write_buffer_size, 2048);
	assert_eq!(cfg.max_message_size, Some(512));
	assert_eq!(cfg.max_frame_size, Some(512));
}
