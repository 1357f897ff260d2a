//! In-memory per-worker share counters for the open stats period.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::types::PendingStat;

/// Share counters keyed by worker name, shared by every share producer and
/// drained once per period by the collector.
#[derive(Debug, Default)]
pub struct Accumulator {
    pending: Mutex<HashMap<String, PendingStat>>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Merge one share submission into the worker's pending entry.
    ///
    /// Share counters are summed. `reported_hashrate` and `ip_address`
    /// replace whatever the worker last reported.
    pub fn record(
        &self,
        worker_name: &str,
        valid_delta: u64,
        stale_delta: u64,
        invalid_delta: u64,
        reported_hashrate: f64,
        ip_address: &str,
    ) {
        let mut pending = self.pending.lock();
        let stat = pending.entry(worker_name.to_string()).or_default();

        stat.valid_shares = stat.valid_shares.saturating_add(valid_delta);
        stat.stale_shares = stat.stale_shares.saturating_add(stale_delta);
        stat.invalid_shares = stat.invalid_shares.saturating_add(invalid_delta);
        stat.reported_hashrate = reported_hashrate;
        if stat.ip_address != ip_address {
            stat.ip_address = ip_address.to_string();
        }
    }

    /// Take every pending entry, leaving the accumulator empty.
    ///
    /// The swap happens under the same lock `record` takes, so each update
    /// lands in exactly one snapshot.
    pub fn snapshot_and_clear(&self) -> HashMap<String, PendingStat> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Number of workers with activity in the open period.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}
