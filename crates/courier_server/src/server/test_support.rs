#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use courier_domain::{ClientId, ConnId, UserId};
use courier_protocol::DigestAlgorithm;
use serde_json::Value;
use tokio::time::timeout;

use crate::config::{AuthSettings, SecretString};
use crate::server::auth::Authenticator;
use crate::server::hub::{Hub, HubConfig};
use crate::server::outbound::{OutboundQueue, OutboundReceiver};
use crate::server::registry::ConnectionHandle;
use crate::server::store::InMemoryStore;

pub const CLIENT_SECRET: &str = "client-secret";
pub const ADMIN_SECRET: &str = "admin-secret";

pub fn user(s: &str) -> UserId {
	UserId::new(s).expect("valid user id")
}

pub fn client(s: &str) -> ClientId {
	ClientId::new(s).expect("valid client id")
}

pub fn authenticator() -> Arc<Authenticator> {
	Arc::new(Authenticator::new(AuthSettings {
		secret: SecretString::new(CLIENT_SECRET),
		admin_secret: SecretString::new(ADMIN_SECRET),
		digest: DigestAlgorithm::Md5,
		token_max_age: None,
	}))
}

pub fn hub_with_store() -> (Hub, Arc<InMemoryStore>) {
	let store = Arc::new(InMemoryStore::new());
	let hub = Hub::new(store.clone(), None, HubConfig::default());
	(hub, store)
}

pub fn queue() -> (OutboundQueue, OutboundReceiver) {
	OutboundQueue::new(64, Duration::from_millis(100))
}

pub fn handle(conn_id: ConnId, u: &str, c: &str) -> (ConnectionHandle, OutboundReceiver) {
	let (queue, rx) = queue();
	(
		ConnectionHandle {
			conn_id,
			user: user(u),
			client_id: client(c),
			queue,
		},
		rx,
	)
}

/// Next queued frame as JSON, failing the test after a short wait.
pub async fn next_json(rx: &mut OutboundReceiver) -> Value {
	let text = timeout(Duration::from_millis(500), rx.frames.recv())
		.await
		.expect("frame within timeout")
		.expect("queue open");
	serde_json::from_str(&text).expect("valid json frame")
}

/// Assert nothing else is queued right now.
pub async fn assert_idle(rx: &mut OutboundReceiver) {
	let got = timeout(Duration::from_millis(50), rx.frames.recv()).await;
	assert!(got.is_err(), "unexpected frame: {got:?}");
}

/// Ids carried by an `m` frame.
pub fn push_ids(frame: &Value) -> Vec<String> {
	assert_eq!(frame["t"], "m", "expected push frame, got {frame}");
	frame["ms"]
		.as_array()
		.expect("ms array")
		.iter()
		.map(|m| m["id"].as_str().expect("id string").to_string())
		.collect()
}
