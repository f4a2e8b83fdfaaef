#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use courier_domain::OutgoingMessage;
use courier_protocol::{ClusterEnvelope, PublishBody};
use futures::StreamExt;
use tokio::time::{sleep, timeout};

use crate::server::cluster::{ClusterBus, ClusterConfig, ClusterLink, InMemoryBus, spawn_replicator};
use crate::server::fanout::PublishOrigin;
use crate::server::hub::{Hub, HubConfig};
use crate::server::store::InMemoryStore;
use crate::server::test_support::{assert_idle, handle, next_json, push_ids, user};

const CHANNEL: &str = "courier-test";

fn node(bus: &InMemoryBus, name: &str) -> (Hub, Arc<InMemoryStore>) {
	let store = Arc::new(InMemoryStore::new());
	let link = ClusterLink::new(
		Arc::new(bus.clone()),
		ClusterConfig {
			node_name: name.to_string(),
			channel: CHANNEL.to_string(),
			resubscribe_delay: Duration::from_millis(20),
		},
	);
	let hub = Hub::new(store.clone(), Some(link), HubConfig::default());
	(hub, store)
}

async fn wait_for_subscribers(bus: &InMemoryBus, n: usize) {
	timeout(Duration::from_secs(2), async {
		while bus.subscriber_count(CHANNEL) < n {
			sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.expect("subscribers within timeout");
}

#[tokio::test]
async fn local_publish_replicates_to_peer_and_skips_own_echo() {
	let bus = InMemoryBus::new();
	let (a, a_store) = node(&bus, "node-a");
	let (b, b_store) = node(&bus, "node-b");
	let _ra = spawn_replicator(a.clone()).expect("cluster enabled");
	let _rb = spawn_replicator(b.clone()).expect("cluster enabled");
	wait_for_subscribers(&bus, 2).await;

	let (on_a, mut a_rx) = handle(1, "alice", "phone");
	let (on_b, mut b_rx) = handle(1, "alice", "laptop");
	a.register(on_a).await;
	b.register(on_b).await;

	let m = OutgoingMessage::new(vec![user("alice")], vec![], "hello");
	let id = m.id.to_string();
	let report = a.publish(m, PublishOrigin::Local).await;

	assert_eq!(push_ids(&next_json(&mut a_rx).await), vec![id.clone()]);
	let replicated = next_json(&mut b_rx).await;
	assert_eq!(push_ids(&replicated), vec![id]);
	assert_eq!(replicated["ms"][0]["ts"], report.timestamp);

	// The echo on node-a must not produce a second push.
	assert_idle(&mut a_rx).await;
	assert_idle(&mut b_rx).await;

	assert_eq!(a_store.message_count().await, 1);
	assert_eq!(b_store.message_count().await, 0);
	assert_eq!(b_store.delivery_count().await, 1);
}

#[tokio::test]
async fn replicated_messages_are_not_reannounced() {
	let bus = InMemoryBus::new();
	let (b, _b_store) = node(&bus, "node-b");
	let _rb = spawn_replicator(b.clone()).expect("cluster enabled");
	wait_for_subscribers(&bus, 1).await;

	let mut tap = bus.subscribe(CHANNEL).await.unwrap();

	let (h, mut rx) = handle(1, "alice", "phone");
	b.register(h).await;

	let env = ClusterEnvelope {
		node_name: "node-a".to_string(),
		message: PublishBody::from(&OutgoingMessage::new(vec![user("alice")], vec![], "from-a")),
		timestamp: 99,
	};
	bus.publish(CHANNEL, serde_json::to_vec(&env).unwrap()).await.unwrap();

	assert_eq!(next_json(&mut rx).await["ms"][0]["ts"], 99);

	let first = timeout(Duration::from_millis(200), tap.next()).await.unwrap().unwrap().unwrap();
	let seen: ClusterEnvelope = serde_json::from_slice(&first).unwrap();
	assert_eq!(seen.node_name, "node-a");
	assert!(timeout(Duration::from_millis(50), tap.next()).await.is_err());
}

#[tokio::test]
async fn undecodable_payloads_are_skipped() {
	let bus = InMemoryBus::new();
	let (b, _b_store) = node(&bus, "node-b");
	let _rb = spawn_replicator(b.clone()).expect("cluster enabled");
	wait_for_subscribers(&bus, 1).await;

	let (h, mut rx) = handle(1, "alice", "phone");
	b.register(h).await;

	bus.publish(CHANNEL, b"not json".to_vec()).await.unwrap();
	let bad_id = ClusterEnvelope {
		node_name: "node-a".to_string(),
		message: PublishBody {
			message_id: String::new(),
			users: vec!["alice".to_string()],
			..Default::default()
		},
		timestamp: 1,
	};
	bus.publish(CHANNEL, serde_json::to_vec(&bad_id).unwrap()).await.unwrap();

	let good = ClusterEnvelope {
		node_name: "node-a".to_string(),
		message: PublishBody::from(&OutgoingMessage::new(vec![user("alice")], vec![], "ok")),
		timestamp: 2,
	};
	bus.publish(CHANNEL, serde_json::to_vec(&good).unwrap()).await.unwrap();

	assert_eq!(next_json(&mut rx).await["ms"][0]["data"], "ok");
	assert_idle(&mut rx).await;
}

#[tokio::test]
async fn replicator_resubscribes_after_bus_disconnect() {
	let bus = InMemoryBus::new();
	let (b, _b_store) = node(&bus, "node-b");
	let _rb = spawn_replicator(b.clone()).expect("cluster enabled");
	wait_for_subscribers(&bus, 1).await;

	bus.disconnect(CHANNEL);
	wait_for_subscribers(&bus, 1).await;

	let (h, mut rx) = handle(1, "alice", "phone");
	b.register(h).await;

	let env = ClusterEnvelope {
		node_name: "node-a".to_string(),
		message: PublishBody::from(&OutgoingMessage::new(vec![user("alice")], vec![], "after")),
		timestamp: 5,
	};
	bus.publish(CHANNEL, serde_json::to_vec(&env).unwrap()).await.unwrap();
	assert_eq!(next_json(&mut rx).await["ms"][0]["data"], "after");
}

#[tokio::test]
async fn replicator_is_not_started_without_cluster_link() {
	let store = Arc::new(InMemoryStore::new());
	let hub = Hub::new(store, None, HubConfig::default());
	assert!(spawn_replicator(hub).is_none());
}
