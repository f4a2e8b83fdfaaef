#![forbid(unsafe_code)]

use std::sync::Arc;

use courier_domain::ConnId;
use tracing::info;

use crate::server::cluster::ClusterLink;
use crate::server::registry::{ConnectionHandle, Registry};
use crate::server::store::MessageStore;

/// Hub settings.
#[derive(Debug, Clone)]
pub struct HubConfig {
	/// Messages per offline replay frame.
	pub replay_batch_size: usize,
}

impl Default for HubConfig {
	fn default() -> Self {
		Self { replay_batch_size: 5 }
	}
}

/// Shared messaging engine: registry, storage and optional cluster link.
///
/// Cheap to clone; every connection task and the admin gateway hold one.
#[derive(Clone)]
pub struct Hub {
	inner: Arc<HubInner>,
}

struct HubInner {
	registry: Registry,
	store: Arc<dyn MessageStore>,
	cluster: Option<ClusterLink>,
	cfg: HubConfig,
}

impl Hub {
	pub fn new(store: Arc<dyn MessageStore>, cluster: Option<ClusterLink>, cfg: HubConfig) -> Self {
		Self {
			inner: Arc::new(HubInner {
				registry: Registry::new(),
				store,
				cluster,
				cfg,
			}),
		}
	}

	pub fn registry(&self) -> &Registry {
		&self.inner.registry
	}

	pub fn store(&self) -> &Arc<dyn MessageStore> {
		&self.inner.store
	}

	pub fn cluster(&self) -> Option<&ClusterLink> {
		self.inner.cluster.as_ref()
	}

	pub fn config(&self) -> &HubConfig {
		&self.inner.cfg
	}

	/// Make an authenticated connection reachable, then replay its user's
	/// unacknowledged messages onto it.
	pub async fn register(&self, handle: ConnectionHandle) {
		info!(
			conn_id = handle.conn_id,
			user = %handle.user,
			client_id = %handle.client_id,
			"register"
		);

		if let Some(evicted) = self.registry().insert(handle.clone()) {
			info!(
				conn_id = handle.conn_id,
				evicted_conn_id = evicted.conn_id,
				user = %handle.user,
				client_id = %handle.client_id,
				"evicted previous connection for the same client"
			);
		}

		self.replay_offline(&handle).await;
	}

	/// Drop a connection from the registry and close its queue. Idempotent.
	pub fn unregister(&self, conn_id: ConnId) {
		if let Some(handle) = self.registry().remove(conn_id) {
			info!(conn_id, user = %handle.user, client_id = %handle.client_id, "unregister");
		}
	}
}
