#![forbid(unsafe_code)]

use std::sync::Arc;

use courier_domain::{OutgoingMessage, Tag, unix_secs_now};
use courier_protocol::frames::client;
use serde_json::json;

use crate::server::connection::Session;
use crate::server::fanout::PublishOrigin;
use crate::server::hub::Hub;
use crate::server::outbound::OutboundReceiver;
use crate::server::store::{InMemoryStore, MessageStore};
use crate::server::test_support::{
	CLIENT_SECRET, assert_idle, authenticator, hub_with_store, next_json, push_ids, queue, user,
};

fn session(hub: &Hub, conn_id: u64) -> (Session, OutboundReceiver) {
	let (q, rx) = queue();
	(Session::new(conn_id, hub.clone(), authenticator(), q), rx)
}

fn login_frame(id: &str, u: &str, c: &str) -> String {
	let ts = unix_secs_now();
	let token = authenticator().login_token(u, c, ts);
	client::login(id, u, c, &token, ts)
}

async fn logged_in(hub: &Hub) -> (Session, OutboundReceiver) {
	let (mut s, mut rx) = session(hub, 1);
	s.handle_text(&login_frame("1", "alice", "phone")).await;
	let reply = next_json(&mut rx).await;
	assert_eq!(reply["c"], 200);
	(s, rx)
}

#[tokio::test]
async fn frames_before_login_get_auth_reply_with_their_type() {
	let (hub, store) = hub_with_store();
	let (mut s, mut rx) = session(&hub, 1);

	s.handle_text(&client::tags("7", &[("news".to_string(), true)])).await;
	let reply = next_json(&mut rx).await;
	assert_eq!(reply, json!({ "t": "r", "rt": "t", "i": "7", "c": 401, "m": "" }));

	s.handle_text(&client::ack("8", &["x".to_string()])).await;
	let reply = next_json(&mut rx).await;
	assert_eq!(reply["rt"], "a");
	assert_eq!(reply["c"], 401);

	s.handle_text(r#"{"t":"zz","i":"9"}"#).await;
	assert_eq!(next_json(&mut rx).await["c"], 401);

	assert!(store.users_by_tags(&[Tag::new("news").unwrap()]).await.unwrap().is_empty());
	assert!(s.user().is_none());
}

#[tokio::test]
async fn login_success_replies_with_client_id_and_registers() {
	let (hub, _store) = hub_with_store();
	let (mut s, mut rx) = session(&hub, 1);

	s.handle_text(&login_frame("1", "alice", "phone")).await;
	let reply = next_json(&mut rx).await;
	assert_eq!(reply, json!({ "t": "r", "rt": "l", "i": "1", "c": 200, "m": "phone" }));
	assert_eq!(s.user(), Some(&user("alice")));
	assert_eq!(hub.registry().lookup_by_user(&user("alice")).len(), 1);
}

#[tokio::test]
async fn bad_token_is_rejected_with_auth() {
	let (hub, _store) = hub_with_store();
	let (mut s, mut rx) = session(&hub, 1);

	s.handle_text(&client::login("1", "alice", "phone", "not-a-token", 1)).await;
	let reply = next_json(&mut rx).await;
	assert_eq!(reply["rt"], "l");
	assert_eq!(reply["c"], 401);
	assert!(s.user().is_none());
	assert_eq!(hub.registry().connection_count(), 0);
}

#[tokio::test]
async fn blank_identity_fails_login() {
	let (hub, _store) = hub_with_store();
	let (mut s, mut rx) = session(&hub, 1);

	let token = authenticator().login_token("", "phone", 1);
	s.handle_text(&client::login("1", "  ", "phone", &token, 1)).await;
	let reply = next_json(&mut rx).await;
	assert_eq!(reply["c"], 400);
	assert_eq!(reply["m"], "no user or clientid");
}

#[tokio::test]
async fn second_login_fails() {
	let (hub, _store) = hub_with_store();
	let (mut s, mut rx) = logged_in(&hub).await;

	s.handle_text(&login_frame("2", "bob", "phone")).await;
	let reply = next_json(&mut rx).await;
	assert_eq!(reply["rt"], "l");
	assert_eq!(reply["i"], "2");
	assert_eq!(reply["c"], 400);
	assert_eq!(s.user(), Some(&user("alice")));
}

#[tokio::test]
async fn tag_frame_updates_tags_and_replies_ok() {
	let (hub, store) = hub_with_store();
	let (mut s, mut rx) = logged_in(&hub).await;

	s.handle_text(&client::tags("3", &[("news".to_string(), true), ("sport".to_string(), false)]))
		.await;
	let reply = next_json(&mut rx).await;
	assert_eq!(reply, json!({ "t": "r", "rt": "t", "i": "3", "c": 200, "m": "" }));

	let tagged = store.users_by_tags(&[Tag::new("news").unwrap()]).await.unwrap();
	assert_eq!(tagged, vec![user("alice")]);
}

#[tokio::test]
async fn ack_updates_store_without_reply() {
	let (hub, store) = hub_with_store();
	let m = OutgoingMessage::new(vec![user("alice")], vec![], "hi");
	let id = m.id.clone();
	hub.publish(m, PublishOrigin::Local).await;

	let (mut s, mut rx) = logged_in(&hub).await;
	assert_eq!(push_ids(&next_json(&mut rx).await), vec![id.to_string()]);

	s.handle_text(&client::ack("4", &[id.to_string()])).await;
	assert_idle(&mut rx).await;
	assert_eq!(store.delivery_acked(&id, &user("alice")).await, Some(true));
}

#[tokio::test]
async fn malformed_json_is_dropped_and_invalid_fields_get_error_frame() {
	let (hub, _store) = hub_with_store();
	let (mut s, mut rx) = logged_in(&hub).await;

	s.handle_text("{not json").await;
	s.handle_text("[1,2]").await;
	assert_idle(&mut rx).await;

	s.handle_text(r#"{"t":"a","i":"5","id":"not-a-list"}"#).await;
	let reply = next_json(&mut rx).await;
	assert_eq!(reply["t"], "e");
	assert_eq!(reply["rt"], "a");
	assert_eq!(reply["i"], "5");
}

#[tokio::test]
async fn unknown_frame_after_login_is_ignored() {
	let (hub, _store) = hub_with_store();
	let (mut s, mut rx) = logged_in(&hub).await;

	s.handle_text(r#"{"t":"zz","i":"6"}"#).await;
	assert_idle(&mut rx).await;
}

#[tokio::test]
async fn login_reply_precedes_offline_replay() {
	let store = Arc::new(InMemoryStore::new());
	let hub = Hub::new(store, None, Default::default());
	hub.publish(OutgoingMessage::new(vec![user("alice")], vec![], "queued"), PublishOrigin::Local)
		.await;

	let (mut s, mut rx) = session(&hub, 1);
	s.handle_text(&login_frame("1", "alice", "phone")).await;

	assert_eq!(next_json(&mut rx).await["t"], "r");
	let push = next_json(&mut rx).await;
	assert_eq!(push["ms"][0]["data"], "queued");
}

#[test]
fn test_secret_is_what_tokens_are_signed_with() {
	let ts = 1_700_000_000;
	let token = authenticator().login_token("alice", "phone", ts);
	assert_eq!(
		token,
		courier_protocol::token_digest(courier_protocol::DigestAlgorithm::Md5, CLIENT_SECRET, "alice", "phone", ts)
	);
}
