#![forbid(unsafe_code)]

use std::time::Duration;

/// Node name derived from the local clock, e.g. `Node-20240131235959`.
pub fn default_node_name() -> String {
	chrono::Local::now().format("Node-%Y%m%d%H%M%S").to_string()
}

/// Exponential backoff bounded by `[min, max]`.
pub fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
	let pow = attempt.min(16);
	let ms = min.as_millis().saturating_mul(1u128 << pow);
	let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
	d.min(max).max(min)
}
