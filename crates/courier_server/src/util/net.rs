#![forbid(unsafe_code)]

use std::future::Future;
use std::io;
use std::time::Duration;

use tracing::warn;

use crate::util::time::backoff_delay;

const ACCEPT_RETRY_MIN: Duration = Duration::from_millis(10);
const ACCEPT_RETRY_MAX: Duration = Duration::from_secs(1);

/// Run `accept` until it yields a connection. Failures (fd exhaustion, aborted
/// handshakes) are logged and retried with backoff; a listener never gives up.
pub async fn accept_retrying<F, Fut, T>(listener: &'static str, mut accept: F) -> T
where
	F: FnMut() -> Fut,
	Fut: Future<Output = io::Result<T>>,
{
	let mut failures = 0u32;
	loop {
		match accept().await {
			Ok(conn) => return conn,
			Err(e) => {
				let delay = backoff_delay(failures, ACCEPT_RETRY_MIN, ACCEPT_RETRY_MAX);
				failures = failures.saturating_add(1);
				metrics::counter!("courier_accept_errors_total", "listener" => listener).increment(1);
				warn!(listener, failures, error = %e, delay_ms = delay.as_millis() as u64, "accept failed; retrying");
				tokio::time::sleep(delay).await;
			}
		}
	}
}
