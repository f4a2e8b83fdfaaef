#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

/// Why a frame could not be queued for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
	/// The queue stayed full for the whole enqueue timeout.
	#[error("outbound queue full")]
	Timeout,
	/// The connection is shutting down.
	#[error("outbound queue closed")]
	Closed,
}

/// Bounded queue of encoded text frames feeding one connection's writer.
///
/// Cloned handles share the same channel. `close` is observed by the writer
/// even while other handles are still alive.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
	tx: mpsc::Sender<String>,
	closed: Arc<watch::Sender<bool>>,
	enqueue_timeout: Duration,
}

/// Writer side of an `OutboundQueue`.
#[derive(Debug)]
pub struct OutboundReceiver {
	pub frames: mpsc::Receiver<String>,
	pub closed: watch::Receiver<bool>,
}

impl OutboundQueue {
	pub fn new(capacity: usize, enqueue_timeout: Duration) -> (Self, OutboundReceiver) {
		let (tx, frames) = mpsc::channel(capacity.max(1));
		let (closed_tx, closed) = watch::channel(false);
		(
			Self {
				tx,
				closed: Arc::new(closed_tx),
				enqueue_timeout,
			},
			OutboundReceiver { frames, closed },
		)
	}

	/// Queue a frame, waiting up to the enqueue timeout while the queue is full.
	pub async fn enqueue(&self, frame: String) -> Result<(), EnqueueError> {
		if self.is_closed() {
			return Err(EnqueueError::Closed);
		}
		match timeout(self.enqueue_timeout, self.tx.send(frame)).await {
			Ok(Ok(())) => Ok(()),
			Ok(Err(_)) => Err(EnqueueError::Closed),
			Err(_) => Err(EnqueueError::Timeout),
		}
	}

	/// Signal the writer to send a Close frame and stop. Idempotent.
	pub fn close(&self) {
		self.closed.send_replace(true);
	}

	pub fn is_closed(&self) -> bool {
		*self.closed.borrow() || self.tx.is_closed()
	}
}
