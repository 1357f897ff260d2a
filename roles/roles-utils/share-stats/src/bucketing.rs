//! Period alignment for stats buckets.
//!
//! Buckets are derived from wall-clock Unix time only, never from process
//! start time, so every collector instance agrees on the same boundaries:
//!
//! ```ignore
//! use share_stats::bucketing::{bucket_start, period_index};
//!
//! assert_eq!(period_index(6_059, 60), 100);
//! assert_eq!(bucket_start(6_059, 60), 6_000);
//! ```

use std::time::Duration;

/// Index of the period containing `timestamp`: `floor(timestamp / period_seconds)`.
///
/// A zero period yields index 0.
pub fn period_index(timestamp: u64, period_seconds: u64) -> u64 {
    timestamp.checked_div(period_seconds).unwrap_or(0)
}

/// Start of the bucket containing `timestamp`. Always a multiple of `period_seconds`.
pub fn bucket_start(timestamp: u64, period_seconds: u64) -> u64 {
    period_index(timestamp, period_seconds) * period_seconds
}

/// Whether moving from `prev_index` to `current_index` crosses a new boundary.
///
/// Only a strictly greater index counts, so a wall clock stepping backwards
/// never re-opens a period that was already flushed.
pub fn crossed_boundary(prev_index: u64, current_index: u64) -> bool {
    current_index > prev_index
}

/// Time left from `now_millis` until the next period boundary.
///
/// Never returns zero: when `now_millis` sits exactly on a boundary the
/// full period is returned.
pub fn until_next_boundary(now_millis: u64, period_seconds: u64) -> Duration {
    let period_millis = period_seconds.saturating_mul(1000);
    if period_millis == 0 {
        return Duration::from_millis(1);
    }

    let elapsed = now_millis % period_millis;
    Duration::from_millis(period_millis - elapsed)
}
