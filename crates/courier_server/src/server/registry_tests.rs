#![forbid(unsafe_code)]

use crate::server::outbound::EnqueueError;
use crate::server::registry::Registry;
use crate::server::test_support::{handle, user};

#[tokio::test]
async fn lookup_returns_every_client_of_a_user() {
	let reg = Registry::new();
	let (a, _rx_a) = handle(1, "alice", "phone");
	let (b, _rx_b) = handle(2, "alice", "laptop");
	let (c, _rx_c) = handle(3, "bob", "phone");

	assert!(reg.insert(a).is_none());
	assert!(reg.insert(b).is_none());
	assert!(reg.insert(c).is_none());

	let mut ids: Vec<_> = reg.lookup_by_user(&user("alice")).iter().map(|h| h.conn_id).collect();
	ids.sort();
	assert_eq!(ids, vec![1, 2]);
	assert_eq!(reg.connection_count(), 3);
	assert_eq!(reg.user_count(), 2);
	assert!(reg.lookup_by_user(&user("carol")).is_empty());
}

#[tokio::test]
async fn same_client_login_evicts_previous_connection() {
	let reg = Registry::new();
	let (old, mut old_rx) = handle(1, "alice", "phone");
	let (new, _new_rx) = handle(2, "alice", "phone");
	let old_queue = old.queue.clone();

	reg.insert(old);
	let evicted = reg.insert(new).expect("previous connection evicted");
	assert_eq!(evicted.conn_id, 1);

	assert!(old_queue.is_closed());
	assert_eq!(old_queue.enqueue("x".to_string()).await, Err(EnqueueError::Closed));
	assert!(*old_rx.closed.borrow_and_update());

	let live: Vec<_> = reg.lookup_by_user(&user("alice")).iter().map(|h| h.conn_id).collect();
	assert_eq!(live, vec![2]);
	assert!(reg.get(1).is_none());
}

#[tokio::test]
async fn removing_replaced_connection_keeps_successor() {
	let reg = Registry::new();
	let (old, _old_rx) = handle(1, "alice", "phone");
	let (new, _new_rx) = handle(2, "alice", "phone");
	reg.insert(old);
	reg.insert(new);

	assert!(reg.remove(1).is_none());
	let live: Vec<_> = reg.lookup_by_user(&user("alice")).iter().map(|h| h.conn_id).collect();
	assert_eq!(live, vec![2]);
}

#[tokio::test]
async fn remove_is_idempotent_and_drops_empty_users() {
	let reg = Registry::new();
	let (h, _rx) = handle(7, "alice", "phone");
	let queue = h.queue.clone();
	reg.insert(h);

	assert_eq!(reg.remove(7).map(|h| h.conn_id), Some(7));
	assert!(queue.is_closed());
	assert!(reg.remove(7).is_none());
	assert_eq!(reg.connection_count(), 0);
	assert_eq!(reg.user_count(), 0);
}
