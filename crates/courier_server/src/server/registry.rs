#![forbid(unsafe_code)]

use std::collections::HashMap;

use courier_domain::{ClientId, ConnId, UserId};
use dashmap::DashMap;
use tracing::debug;

use crate::server::outbound::OutboundQueue;

/// Registry view of one authenticated connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
	pub conn_id: ConnId,
	pub user: UserId,
	pub client_id: ClientId,
	pub queue: OutboundQueue,
}

/// Live authenticated connections, indexed by connection id and by user.
///
/// Both maps are sharded; lookups may race with concurrent register and
/// unregister calls but always observe whole entries.
#[derive(Debug, Default)]
pub struct Registry {
	conns: DashMap<ConnId, ConnectionHandle>,
	users: DashMap<UserId, HashMap<ClientId, ConnId>>,
}

impl Registry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Insert a connection. An existing connection for the same
	/// `(user, client_id)` is evicted, its queue closed, and returned.
	pub fn insert(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
		let conn_id = handle.conn_id;
		let user = handle.user.clone();
		let client_id = handle.client_id.clone();

		self.conns.insert(conn_id, handle);

		let previous = {
			let mut clients = self.users.entry(user.clone()).or_default();
			clients.insert(client_id.clone(), conn_id)
		};

		let evicted = previous
			.filter(|prev| *prev != conn_id)
			.and_then(|prev| self.conns.remove(&prev))
			.map(|(_, h)| h);

		if let Some(old) = evicted.as_ref() {
			old.queue.close();
			debug!(
				conn_id,
				evicted_conn_id = old.conn_id,
				user = %user,
				client_id = %client_id,
				"registry: replaced existing connection"
			);
		}

		evicted
	}

	/// Remove a connection and close its queue. Unknown ids are a no-op, and a
	/// connection that was already replaced does not disturb its successor.
	pub fn remove(&self, conn_id: ConnId) -> Option<ConnectionHandle> {
		let (_, handle) = self.conns.remove(&conn_id)?;
		handle.queue.close();

		self.users.remove_if_mut(&handle.user, |_, clients| {
			if clients.get(&handle.client_id) == Some(&conn_id) {
				clients.remove(&handle.client_id);
			}
			clients.is_empty()
		});

		Some(handle)
	}

	/// Current connections of `user`.
	pub fn lookup_by_user(&self, user: &UserId) -> Vec<ConnectionHandle> {
		let ids = match self.users.get(user) {
			Some(clients) => clients.values().copied().collect::<Vec<_>>(),
			None => return Vec::new(),
		};
		ids.into_iter()
			.filter_map(|id| self.conns.get(&id).map(|h| h.value().clone()))
			.collect()
	}

	pub fn get(&self, conn_id: ConnId) -> Option<ConnectionHandle> {
		self.conns.get(&conn_id).map(|h| h.value().clone())
	}

	pub fn connection_count(&self) -> usize {
		self.conns.len()
	}

	pub fn user_count(&self) -> usize {
		self.users.len()
	}
}
