#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use courier_domain::{MessageId, OutgoingMessage, Tag};
use courier_protocol::TagChanges;

use crate::server::fanout::{PublishOrigin, resolve_recipients};
use crate::server::hub::{Hub, HubConfig};
use crate::server::outbound::OutboundQueue;
use crate::server::registry::ConnectionHandle;
use crate::server::store::{InMemoryStore, MessageStore};
use crate::server::test_support::{assert_idle, client, handle, hub_with_store, next_json, push_ids, user};

fn tag(s: &str) -> Tag {
	Tag::new(s).expect("valid tag")
}

fn msg(users: &[&str], tags: &[&str], data: &str) -> OutgoingMessage {
	OutgoingMessage::new(
		users.iter().map(|u| user(u)).collect(),
		tags.iter().map(|t| tag(t)).collect(),
		data,
	)
}

#[tokio::test]
async fn recipients_are_users_then_tag_members_without_duplicates() {
	let (hub, store) = hub_with_store();
	store.add_tags(&user("alice"), &[tag("news")]).await.unwrap();
	store.add_tags(&user("bob"), &[tag("news"), tag("sport")]).await.unwrap();

	let m = msg(&["carol", "alice"], &["news", "sport"], "x");
	let got = resolve_recipients(&hub, &m).await;
	assert_eq!(got, vec![user("carol"), user("alice"), user("bob")]);
}

#[tokio::test]
async fn publish_reaches_every_device_and_records_deliveries() {
	let (hub, store) = hub_with_store();
	let (phone, mut phone_rx) = handle(1, "alice", "phone");
	let (laptop, mut laptop_rx) = handle(2, "alice", "laptop");
	hub.register(phone).await;
	hub.register(laptop).await;

	let m = msg(&["alice", "bob"], &[], "hello");
	let id = m.id.clone();
	let report = hub.publish(m, PublishOrigin::Local).await;

	assert_eq!(report.recipients, 2);
	assert_eq!(report.delivered, 2);

	for rx in [&mut phone_rx, &mut laptop_rx] {
		let frame = next_json(rx).await;
		assert_eq!(push_ids(&frame), vec![id.to_string()]);
		assert_eq!(frame["ms"][0]["data"], "hello");
		assert_eq!(frame["ms"][0]["ts"], report.timestamp);
	}

	assert_eq!(store.message_count().await, 1);
	assert_eq!(store.delivery_acked(&id, &user("alice")).await, Some(false));
	assert_eq!(store.delivery_acked(&id, &user("bob")).await, Some(false));
}

#[tokio::test]
async fn tagged_users_receive_pushes_after_tag_update() {
	let (hub, _store) = hub_with_store();
	let (h, mut rx) = handle(1, "alice", "phone");
	hub.register(h).await;

	hub.update_tags(
		&user("alice"),
		&TagChanges {
			add: vec![tag("news")],
			remove: vec![],
		},
	)
	.await
	.unwrap();

	hub.publish(msg(&[], &["news"], "tagged"), PublishOrigin::Local).await;
	let frame = next_json(&mut rx).await;
	assert_eq!(frame["ms"][0]["data"], "tagged");

	hub.update_tags(
		&user("alice"),
		&TagChanges {
			add: vec![],
			remove: vec![tag("news")],
		},
	)
	.await
	.unwrap();

	let report = hub.publish(msg(&[], &["news"], "again"), PublishOrigin::Local).await;
	assert_eq!(report.recipients, 0);
	assert_idle(&mut rx).await;
}

#[tokio::test]
async fn replay_sends_unacked_messages_in_batches_of_five() {
	let (hub, _store) = hub_with_store();

	let mut ids = Vec::new();
	for i in 0..12 {
		let m = msg(&["alice"], &[], &format!("m{i}"));
		ids.push(m.id.to_string());
		hub.publish(m, PublishOrigin::Local).await;
	}

	let (h, mut rx) = handle(1, "alice", "phone");
	hub.register(h).await;

	let mut seen = Vec::new();
	for expected in [5usize, 5, 2] {
		let frame = next_json(&mut rx).await;
		let batch = push_ids(&frame);
		assert_eq!(batch.len(), expected);
		seen.extend(batch);
	}
	assert_eq!(seen, ids);
	assert_idle(&mut rx).await;
}

#[tokio::test]
async fn replay_skips_batches_without_stored_bodies() {
	let (hub, _store) = hub_with_store();

	// Replicated publishes record deliveries but leave the body to the origin node.
	for i in 0..5 {
		let m = msg(&["alice"], &[], &format!("remote{i}"));
		hub.publish(m, PublishOrigin::Replicated { timestamp: 100 + i }).await;
	}
	let local = msg(&["alice"], &[], "local");
	let local_id = local.id.to_string();
	hub.publish(local, PublishOrigin::Local).await;

	let (h, mut rx) = handle(1, "alice", "phone");
	hub.register(h).await;

	let frame = next_json(&mut rx).await;
	assert_eq!(push_ids(&frame), vec![local_id]);
	assert_eq!(frame["ms"][0]["data"], "local");
	assert_idle(&mut rx).await;
}

#[tokio::test]
async fn replay_sends_stored_bodies_from_a_partially_missing_batch() {
	let (hub, _store) = hub_with_store();

	let a = msg(&["alice"], &[], "a");
	let b = msg(&["alice"], &[], "b");
	let (a_id, b_id) = (a.id.to_string(), b.id.to_string());
	hub.publish(a, PublishOrigin::Local).await;
	hub.publish(msg(&["alice"], &[], "gone"), PublishOrigin::Replicated { timestamp: 1 })
		.await;
	hub.publish(b, PublishOrigin::Local).await;

	let (h, mut rx) = handle(1, "alice", "phone");
	assert_eq!(hub.replay_offline(&h).await, 2);
	assert_eq!(push_ids(&next_json(&mut rx).await), vec![a_id, b_id]);
	assert_idle(&mut rx).await;
}

#[tokio::test]
async fn acknowledged_messages_are_not_replayed() {
	let (hub, store) = hub_with_store();
	let a = msg(&["alice"], &[], "a");
	let b = msg(&["alice"], &[], "b");
	let (a_id, b_id) = (a.id.clone(), b.id.clone());
	hub.publish(a, PublishOrigin::Local).await;
	hub.publish(b, PublishOrigin::Local).await;

	let changed = hub
		.acknowledge(&user("alice"), &[a_id.clone(), MessageId::new("unknown").unwrap()])
		.await
		.unwrap();
	assert_eq!(changed, 1);
	assert_eq!(store.delivery_acked(&a_id, &user("alice")).await, Some(true));

	let (h, mut rx) = handle(1, "alice", "phone");
	hub.register(h).await;
	let frame = next_json(&mut rx).await;
	assert_eq!(push_ids(&frame), vec![b_id.to_string()]);
	assert_idle(&mut rx).await;
}

#[tokio::test]
async fn acknowledge_with_no_ids_is_a_noop() {
	let (hub, _store) = hub_with_store();
	assert_eq!(hub.acknowledge(&user("alice"), &[]).await.unwrap(), 0);
}

#[tokio::test]
async fn full_queue_drops_push_but_keeps_delivery_unacked() {
	let store = Arc::new(InMemoryStore::new());
	let hub = Hub::new(store.clone(), None, HubConfig::default());

	let (queue, mut rx) = OutboundQueue::new(1, Duration::from_millis(20));
	hub.register(ConnectionHandle {
		conn_id: 1,
		user: user("alice"),
		client_id: client("phone"),
		queue,
	})
	.await;

	let first = msg(&["alice"], &[], "first");
	let second = msg(&["alice"], &[], "second");
	let second_id = second.id.clone();

	assert_eq!(hub.publish(first, PublishOrigin::Local).await.delivered, 1);
	assert_eq!(hub.publish(second, PublishOrigin::Local).await.delivered, 0);

	assert_eq!(store.delivery_acked(&second_id, &user("alice")).await, Some(false));
	assert_eq!(next_json(&mut rx).await["ms"][0]["data"], "first");
	assert_idle(&mut rx).await;
}

#[tokio::test]
async fn replicated_publish_uses_origin_timestamp_and_skips_persisting_the_body() {
	let (hub, store) = hub_with_store();
	let (h, mut rx) = handle(1, "alice", "phone");
	hub.register(h).await;

	let report = hub
		.publish(msg(&["alice"], &[], "remote"), PublishOrigin::Replicated { timestamp: 1234 })
		.await;
	assert_eq!(report.timestamp, 1234);
	assert_eq!(store.message_count().await, 0);
	assert_eq!(store.delivery_count().await, 1);

	let frame = next_json(&mut rx).await;
	assert_eq!(frame["ms"][0]["ts"], 1234);
}

#[tokio::test]
async fn unregister_stops_delivery() {
	let (hub, _store) = hub_with_store();
	let (h, _rx) = handle(1, "alice", "phone");
	hub.register(h).await;
	hub.unregister(1);
	hub.unregister(1);

	let report = hub.publish(msg(&["alice"], &[], "late"), PublishOrigin::Local).await;
	assert_eq!(report.recipients, 1);
	assert_eq!(report.delivered, 0);
}
