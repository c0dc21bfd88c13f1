//! Timestamp helpers. The store persists ISO-8601 UTC strings (§3, §4.8);
//! durations are measured against `Instant` so wall-clock adjustments never
//! skew a `durationMs` computation.

use std::time::{Duration, Instant};

/// Wall-clock timestamp formatter for `CaptureRecord.timestamp`.
pub fn now_iso8601() -> String {
	chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Monotonic start marker for `RequestTracker` entries.
pub fn monotonic_now() -> Instant {
	Instant::now()
}

/// Milliseconds elapsed since `start`, saturating at zero so a clock
/// anomaly can never produce a negative `durationMs` (invariant 3, §3).
pub fn elapsed_ms(start: Instant) -> i64 {
	let elapsed = Instant::now().saturating_duration_since(start);
	elapsed.as_millis().min(i64::MAX as u128) as i64
}

/// Default TTL after which a stale `RequestTracker` entry is evicted (§3).
pub const REQUEST_TRACKER_TTL: Duration = Duration::from_secs(300);
