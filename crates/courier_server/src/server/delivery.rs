#![forbid(unsafe_code)]

use courier_domain::{MessageId, UserId};
use courier_protocol::{PushFrame, PushItem, TagChanges, encode};
use tracing::{debug, info, warn};

use crate::server::hub::Hub;
use crate::server::outbound::EnqueueError;
use crate::server::registry::ConnectionHandle;

impl Hub {
	/// Send every unacknowledged message of `handle.user` to `handle`, oldest
	/// first, in frames of at most `replay_batch_size` messages. Ids without a
	/// stored body are skipped; storage errors end the replay early.
	pub async fn replay_offline(&self, handle: &ConnectionHandle) -> usize {
		let ids = match self.store().unacked_message_ids(&handle.user).await {
			Ok(ids) => ids,
			Err(e) => {
				warn!(conn_id = handle.conn_id, user = %handle.user, error = %e, "find offline message ids failed");
				return 0;
			}
		};
		if ids.is_empty() {
			return 0;
		}

		let batch = self.config().replay_batch_size.max(1);
		let mut sent = 0usize;

		for chunk in ids.chunks(batch) {
			let messages = match self.store().fetch_messages(chunk).await {
				Ok(m) => m,
				Err(e) => {
					warn!(conn_id = handle.conn_id, user = %handle.user, error = %e, "fetch offline messages failed");
					break;
				}
			};
			if messages.len() < chunk.len() {
				let missing: Vec<&str> = chunk
					.iter()
					.filter(|id| !messages.iter().any(|m| &m.id == *id))
					.map(|id| id.as_str())
					.collect();
				warn!(conn_id = handle.conn_id, user = %handle.user, ?missing, "offline messages without a stored body");
			}
			if messages.is_empty() {
				continue;
			}

			let frame = PushFrame::new(messages.iter().map(PushItem::from).collect());
			if deliver(handle, &frame).await.is_err() {
				break;
			}
			sent += messages.len();
		}

		debug!(conn_id = handle.conn_id, user = %handle.user, pending = ids.len(), sent, "offline replay finished");
		sent
	}

	/// Mark `(user, id)` delivery records acknowledged in one bulk update.
	pub async fn acknowledge(&self, user: &UserId, ids: &[MessageId]) -> anyhow::Result<u64> {
		if ids.is_empty() {
			return Ok(0);
		}
		let changed = self.store().acknowledge(user, ids).await?;
		debug!(user = %user, requested = ids.len(), changed, "acknowledged");
		Ok(changed)
	}

	/// Apply a tag update for `user`.
	pub async fn update_tags(&self, user: &UserId, changes: &TagChanges) -> anyhow::Result<()> {
		info!(user = %user, add = changes.add.len(), remove = changes.remove.len(), "update tags");
		if !changes.add.is_empty() {
			self.store().add_tags(user, &changes.add).await?;
		}
		if !changes.remove.is_empty() {
			self.store().remove_tags(user, &changes.remove).await?;
		}
		Ok(())
	}
}

/// Encode and queue one push frame for a connection. Full or closed queues
/// drop the push; the delivery record stays unacknowledged.
pub(crate) async fn deliver(handle: &ConnectionHandle, frame: &PushFrame) -> Result<(), EnqueueError> {
	let text = match encode(frame) {
		Ok(t) => t,
		Err(e) => {
			warn!(conn_id = handle.conn_id, error = %e, "encode push frame failed");
			return Err(EnqueueError::Closed);
		}
	};

	match handle.queue.enqueue(text).await {
		Ok(()) => {
			metrics::counter!("courier_push_total").increment(1);
			Ok(())
		}
		Err(e) => {
			metrics::counter!("courier_push_dropped_total").increment(1);
			warn!(
				conn_id = handle.conn_id,
				user = %handle.user,
				client_id = %handle.client_id,
				error = %e,
				"push dropped"
			);
			Err(e)
		}
	}
}
