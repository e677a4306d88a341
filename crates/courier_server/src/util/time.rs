#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current Unix time in milliseconds.
#[inline]
pub fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_millis() as i64
}

/// Exponential backoff: `min * 2^attempt`, capped at `max`.
pub fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
	let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
	min.saturating_mul(factor).min(max)
}
