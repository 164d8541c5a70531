//! Wall-clock and monotonic time helpers used by the timer list and the
//! syscall hooks' timeout arithmetic.
//!
//! Unlike the host this crate was modeled on, there is no embedded runtime
//! to ask for the time, so these are thin wrappers around [`std::time`].

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A duration standing in for "wait forever".
pub const INFINITY: Duration = Duration::from_secs(365 * 86400 * 100);

/// Wall clock time, in seconds since the Unix epoch.
pub fn time() -> f64 {
    time64() as f64 / 1e9
}

/// Wall clock time, in nanoseconds since the Unix epoch.
pub fn time64() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Monotonic clock reading suitable for measuring elapsed durations.
///
/// Thin wrapper kept for naming symmetry with the timer list and the
/// scheduler's loop, which both reach for "now" frequently.
pub fn monotonic() -> Instant {
    Instant::now()
}
