//! Record types for per-worker share statistics.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// In-flight counters for a single worker within the open period.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingStat {
    /// Valid shares accepted in the current period
    pub valid_shares: u64,

    /// Stale shares in the current period
    pub stale_shares: u64,

    /// Invalid shares in the current period
    pub invalid_shares: u64,

    /// Last hashrate the worker reported about itself (H/s)
    pub reported_hashrate: f64,

    /// Last IP address the worker submitted from
    pub ip_address: String,
}

/// A single bucketed stats row as written to storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedStat {
    pub worker_name: String,

    pub valid_share_count: u64,

    pub stale_share_count: u64,

    pub invalid_share_count: u64,

    /// Self-reported hashrate (H/s)
    pub reported_hashrate: f64,

    /// Hashrate derived from valid shares and share difficulty (H/s)
    pub effective_hashrate: f64,

    pub ip_address: String,

    /// Bucket-aligned Unix timestamp in seconds
    pub timestamp: u64,
}

impl PersistedStat {
    /// Build the persisted row for `worker_name` from its pending counters.
    pub fn from_pending(
        worker_name: String,
        pending: PendingStat,
        effective_hashrate: f64,
        timestamp: u64,
    ) -> Self {
        Self {
            worker_name,
            valid_share_count: pending.valid_shares,
            stale_share_count: pending.stale_shares,
            invalid_share_count: pending.invalid_shares,
            reported_hashrate: pending.reported_hashrate,
            effective_hashrate,
            ip_address: pending.ip_address,
            timestamp,
        }
    }
}

/// Get current Unix timestamp in seconds.
pub fn unix_timestamp() -> u64 {
    unix_timestamp_millis() / 1000
}

/// Get current Unix timestamp in milliseconds.
pub fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
