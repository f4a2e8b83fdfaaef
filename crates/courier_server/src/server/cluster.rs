#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, anyhow};
use courier_domain::OutgoingMessage;
use courier_protocol::{ClusterEnvelope, PublishBody};
use futures::StreamExt;
use futures::stream::BoxStream;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::fanout::PublishOrigin;
use crate::server::hub::Hub;
use crate::util::time::backoff_delay;

/// Stream of raw payloads received on a bus channel.
pub type PayloadStream = BoxStream<'static, anyhow::Result<Vec<u8>>>;

/// Shared publish/subscribe backbone between nodes.
#[async_trait::async_trait]
pub trait ClusterBus: Send + Sync {
	async fn publish(&self, channel: &str, payload: Vec<u8>) -> anyhow::Result<()>;

	async fn subscribe(&self, channel: &str) -> anyhow::Result<PayloadStream>;

	/// Round-trip check used at startup.
	async fn ping(&self) -> anyhow::Result<()> {
		Ok(())
	}
}

/// Redis pub/sub bus.
#[derive(Clone)]
pub struct RedisBus {
	client: redis::Client,
	conn: redis::aio::ConnectionManager,
}

impl RedisBus {
	pub async fn connect(url: &str) -> anyhow::Result<Self> {
		let client = redis::Client::open(url).context("parse redis url")?;
		let conn = redis::aio::ConnectionManager::new(client.clone())
			.await
			.context("connect redis")?;
		Ok(Self { client, conn })
	}
}

#[async_trait::async_trait]
impl ClusterBus for RedisBus {
	async fn publish(&self, channel: &str, payload: Vec<u8>) -> anyhow::Result<()> {
		let mut conn = self.conn.clone();
		let receivers: i64 = conn.publish(channel, payload).await.context("redis publish")?;
		debug!(channel, receivers, "redis: published");
		Ok(())
	}

	async fn subscribe(&self, channel: &str) -> anyhow::Result<PayloadStream> {
		let mut pubsub = self.client.get_async_pubsub().await.context("open redis pubsub")?;
		pubsub.subscribe(channel).await.context("redis subscribe")?;
		let stream = pubsub
			.into_on_message()
			.map(|msg| msg.get_payload::<Vec<u8>>().context("decode redis payload"));
		Ok(stream.boxed())
	}

	async fn ping(&self) -> anyhow::Result<()> {
		let mut conn = self.conn.clone();
		let pong: String = redis::cmd("PING").query_async(&mut conn).await.context("redis ping")?;
		debug!(%pong, "redis: ping");
		Ok(())
	}
}

/// In-process bus for tests and single-process multi-node setups.
#[derive(Clone, Default)]
pub struct InMemoryBus {
	channels: Arc<Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>>,
}

impl InMemoryBus {
	pub fn new() -> Self {
		Self::default()
	}

	fn sender(&self, channel: &str) -> anyhow::Result<broadcast::Sender<Vec<u8>>> {
		let mut guard = self.channels.lock().map_err(|_| anyhow!("bus lock poisoned"))?;
		Ok(guard
			.entry(channel.to_string())
			.or_insert_with(|| broadcast::channel(1024).0)
			.clone())
	}

	/// End every current subscription on `channel`.
	pub fn disconnect(&self, channel: &str) {
		if let Ok(mut guard) = self.channels.lock() {
			guard.remove(channel);
		}
	}

	pub fn subscriber_count(&self, channel: &str) -> usize {
		self.channels
			.lock()
			.ok()
			.and_then(|g| g.get(channel).map(|s| s.receiver_count()))
			.unwrap_or(0)
	}
}

#[async_trait::async_trait]
impl ClusterBus for InMemoryBus {
	async fn publish(&self, channel: &str, payload: Vec<u8>) -> anyhow::Result<()> {
		// No subscribers is not an error.
		let _ = self.sender(channel)?.send(payload);
		Ok(())
	}

	async fn subscribe(&self, channel: &str) -> anyhow::Result<PayloadStream> {
		let rx = self.sender(channel)?.subscribe();
		let stream = futures::stream::unfold(rx, |mut rx| async move {
			loop {
				match rx.recv().await {
					Ok(payload) => return Some((Ok(payload), rx)),
					Err(broadcast::error::RecvError::Lagged(skipped)) => {
						warn!(skipped, "in-memory bus: subscriber lagged");
					}
					Err(broadcast::error::RecvError::Closed) => return None,
				}
			}
		});
		Ok(stream.boxed())
	}
}

/// This node's identity on the bus.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
	pub node_name: String,
	pub channel: String,
	pub resubscribe_delay: Duration,
}

/// Bus handle plus node identity, owned by the hub.
#[derive(Clone)]
pub struct ClusterLink {
	bus: Arc<dyn ClusterBus>,
	cfg: ClusterConfig,
}

impl ClusterLink {
	pub fn new(bus: Arc<dyn ClusterBus>, cfg: ClusterConfig) -> Self {
		Self { bus, cfg }
	}

	pub fn node_name(&self) -> &str {
		&self.cfg.node_name
	}

	pub fn channel(&self) -> &str {
		&self.cfg.channel
	}

	/// Publish a locally originated message, stamped with its persisted time.
	pub async fn announce(&self, msg: &OutgoingMessage, timestamp: i64) -> anyhow::Result<()> {
		let env = ClusterEnvelope {
			node_name: self.cfg.node_name.clone(),
			message: PublishBody::from(msg),
			timestamp,
		};
		let payload = serde_json::to_vec(&env).context("encode cluster envelope")?;
		self.bus.publish(&self.cfg.channel, payload).await
	}

	/// Decode a bus payload. `None` for our own echoes.
	fn accept(&self, payload: &[u8]) -> anyhow::Result<Option<(OutgoingMessage, i64)>> {
		let env: ClusterEnvelope = serde_json::from_slice(payload).context("decode cluster envelope")?;
		if env.node_name == self.cfg.node_name {
			return Ok(None);
		}
		let origin = env.node_name;
		let timestamp = env.timestamp;
		let msg = env
			.message
			.into_outgoing_with_embedded_id()
			.with_context(|| format!("invalid message id from node {origin}"))?;
		debug!(node = %origin, message_id = %msg.id, "cluster: received");
		Ok(Some((msg, timestamp)))
	}
}

const MAX_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(30);

/// Run the replication subscriber for the node lifetime. Each fault ends the
/// current subscription; a fresh one is opened after `resubscribe_delay`,
/// backing off while subscribing keeps failing.
pub fn spawn_replicator(hub: Hub) -> Option<JoinHandle<()>> {
	let link = hub.cluster()?.clone();
	info!(node = %link.node_name(), channel = %link.channel(), "cluster replicator starting");

	Some(tokio::spawn(async move {
		let min_delay = link.cfg.resubscribe_delay;
		let max_delay = min_delay.max(MAX_RESUBSCRIBE_DELAY);
		let mut failures = 0u32;

		loop {
			match link.bus.subscribe(&link.cfg.channel).await {
				Ok(stream) => {
					failures = 0;
					debug!(channel = %link.cfg.channel, "cluster: subscribed");
					consume(&link, &hub, stream).await;
					warn!(channel = %link.cfg.channel, "cluster subscription ended; resubscribing");
				}
				Err(e) => {
					failures = failures.saturating_add(1);
					warn!(channel = %link.cfg.channel, failures, error = %e, "cluster subscribe failed; retrying");
				}
			}
			tokio::time::sleep(backoff_delay(failures, min_delay, max_delay)).await;
		}
	}))
}

async fn consume(link: &ClusterLink, hub: &Hub, mut stream: PayloadStream) {
	while let Some(item) = stream.next().await {
		let payload = match item {
			Ok(p) => p,
			Err(e) => {
				warn!(error = %e, "cluster stream error");
				return;
			}
		};
		metrics::counter!("courier_cluster_envelopes_in_total").increment(1);

		match link.accept(&payload) {
			Ok(Some((msg, timestamp))) => {
				let hub = hub.clone();
				tokio::spawn(async move {
					hub.publish(msg, PublishOrigin::Replicated { timestamp }).await;
				});
			}
			Ok(None) => {}
			Err(e) => warn!(error = %e, "dropping undecodable cluster payload"),
		}
	}
}
