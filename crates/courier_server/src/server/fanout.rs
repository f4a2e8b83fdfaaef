#![forbid(unsafe_code)]

use std::collections::HashSet;

use courier_domain::{MessageId, OutgoingMessage, UserId, unix_secs_now};
use courier_protocol::{PushFrame, PushItem};
use tracing::{debug, info, warn};

use crate::server::delivery::deliver;
use crate::server::hub::Hub;

/// Where a publish came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOrigin {
	/// Admin ingestion on this node: persist the body and replicate.
	Local,
	/// Received from another node, which already persisted the body at `timestamp`.
	Replicated { timestamp: i64 },
}

/// Outcome of one publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
	pub message_id: MessageId,
	pub timestamp: i64,
	/// Distinct users resolved from the explicit list and tags.
	pub recipients: usize,
	/// Pushes queued on live connections.
	pub delivered: usize,
}

/// Explicit users followed by tag members, each user once.
pub async fn resolve_recipients(hub: &Hub, msg: &OutgoingMessage) -> Vec<UserId> {
	let tagged = if msg.tags.is_empty() {
		Vec::new()
	} else {
		match hub.store().users_by_tags(&msg.tags).await {
			Ok(users) => users,
			Err(e) => {
				warn!(message_id = %msg.id, error = %e, "find tagged users failed");
				Vec::new()
			}
		}
	};

	let mut seen = HashSet::with_capacity(msg.users.len() + tagged.len());
	msg.users
		.iter()
		.cloned()
		.chain(tagged)
		.filter(|u| seen.insert(u.clone()))
		.collect()
}

impl Hub {
	/// Resolve recipients, persist (locally originated messages only), replicate,
	/// record one delivery per recipient and push to their live connections.
	///
	/// Storage and bus failures are logged; delivery is still attempted.
	pub async fn publish(&self, msg: OutgoingMessage, origin: PublishOrigin) -> PublishReport {
		info!(
			message_id = %msg.id,
			users = msg.users.len(),
			tags = msg.tags.len(),
			replicated = matches!(origin, PublishOrigin::Replicated { .. }),
			"publish"
		);
		metrics::counter!("courier_publish_total").increment(1);

		let recipients = resolve_recipients(self, &msg).await;

		let timestamp = match origin {
			PublishOrigin::Replicated { timestamp } => timestamp,
			PublishOrigin::Local => {
				let ts = match self.store().save_message(&msg.id, &msg.data).await {
					Ok(ts) => ts,
					Err(e) => {
						warn!(message_id = %msg.id, error = %e, "save message failed");
						unix_secs_now()
					}
				};

				if let Some(link) = self.cluster()
					&& let Err(e) = link.announce(&msg, ts).await
				{
					warn!(message_id = %msg.id, node = %link.node_name(), error = %e, "cluster publish failed");
				}
				ts
			}
		};

		let frame = PushFrame::new(vec![PushItem {
			id: msg.id.to_string(),
			ts: timestamp,
			data: msg.data.clone(),
		}]);

		let mut delivered = 0usize;
		for user in &recipients {
			if let Err(e) = self.store().save_delivery(&msg.id, user).await {
				warn!(message_id = %msg.id, user = %user, error = %e, "save user message failed");
			}

			for handle in self.registry().lookup_by_user(user) {
				if deliver(&handle, &frame).await.is_ok() {
					delivered += 1;
				}
			}
		}

		debug!(message_id = %msg.id, recipients = recipients.len(), delivered, "publish finished");

		PublishReport {
			message_id: msg.id,
			timestamp,
			recipients: recipients.len(),
			delivered,
		}
	}
}
