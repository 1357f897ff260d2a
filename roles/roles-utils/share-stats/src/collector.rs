//! Periodic flush of accumulated share stats into storage.
//!
//! The collector owns the [`Accumulator`] that share producers write to and a
//! single background task that, at every period boundary, drains it into one
//! storage batch and prunes rows past the retention horizon.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::accumulator::Accumulator;
use crate::bucketing::{bucket_start, crossed_boundary, period_index, until_next_boundary};
use crate::error::{CollectorError, ConfigError};
use crate::metrics::{effective_hashrate, format_hashrate};
use crate::storage::StatsStorage;
use crate::types::{unix_timestamp, unix_timestamp_millis, PersistedStat};

/// Collect stats every minute
pub const DEFAULT_PERIOD_SECS: u64 = 60;

/// Keep stats for one day
pub const DEFAULT_RETENTION_SECS: u64 = 86_400;

#[derive(Debug, Clone, PartialEq)]
pub struct CollectorConfig {
    /// Length of one stats bucket in seconds
    pub period_secs: u64,

    /// Rows older than this many seconds are pruned
    pub retention_secs: u64,

    /// Difficulty every share is issued at
    pub share_difficulty: f64,
}

impl CollectorConfig {
    /// Default period and retention with the given share difficulty.
    pub fn new(share_difficulty: f64) -> Self {
        Self {
            period_secs: DEFAULT_PERIOD_SECS,
            retention_secs: DEFAULT_RETENTION_SECS,
            share_difficulty,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.period_secs == 0 {
            return Err(ConfigError::InvalidPeriod(self.period_secs));
        }

        if !self.share_difficulty.is_finite() || self.share_difficulty <= 0.0 {
            return Err(ConfigError::InvalidShareDifficulty(self.share_difficulty));
        }

        // A horizon shorter than one period would prune rows as soon as they land
        if self.retention_secs < self.period_secs {
            return Err(ConfigError::InvalidRetention {
                retention_secs: self.retention_secs,
                period_secs: self.period_secs,
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMessage {
    ShutdownAll,
}

/// Outcome of a single flush.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushSummary {
    /// Bucket timestamp every row of this flush was written with
    pub timestamp: u64,

    /// Workers with activity in the flushed period
    pub workers: usize,

    /// Sum of effective hashrate across those workers (H/s)
    pub total_effective_hashrate: f64,

    /// False when the batch write failed and the period's rows were dropped
    pub persisted: bool,

    /// Rows removed by pruning, `None` when pruning failed
    pub pruned: Option<u64>,
}

/// Stats collection daemon.
pub struct StatsCollector {
    config: CollectorConfig,
    accumulator: Arc<Accumulator>,
    storage: Arc<dyn StatsStorage>,
    notify_shutdown: broadcast::Sender<ShutdownMessage>,
    last_flushed_bucket: Mutex<Option<u64>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl StatsCollector {
    /// Create a collector, rejecting invalid settings before anything runs.
    pub fn new(
        config: CollectorConfig,
        storage: Arc<dyn StatsStorage>,
    ) -> Result<Self, CollectorError> {
        config.validate()?;

        let (notify_shutdown, _) = broadcast::channel::<ShutdownMessage>(1);

        Ok(Self {
            config,
            accumulator: Arc::new(Accumulator::new()),
            storage,
            notify_shutdown,
            last_flushed_bucket: Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Handle for share producers that only need to record.
    pub fn accumulator(&self) -> Arc<Accumulator> {
        self.accumulator.clone()
    }

    /// Sender the host can use to fan its own shutdown into the collector.
    pub fn shutdown_sender(&self) -> broadcast::Sender<ShutdownMessage> {
        self.notify_shutdown.clone()
    }

    /// Record share activity for `worker_name` in the open period.
    pub fn record(
        &self,
        worker_name: &str,
        valid_delta: u64,
        stale_delta: u64,
        invalid_delta: u64,
        reported_hashrate: f64,
        ip_address: &str,
    ) {
        self.accumulator.record(
            worker_name,
            valid_delta,
            stale_delta,
            invalid_delta,
            reported_hashrate,
            ip_address,
        );
    }

    /// Spawn the flush loop.
    ///
    /// `shutdown_complete_tx` is held by the loop until it exits, so the host
    /// can wait on the matching receiver for a clean shutdown.
    pub fn start(
        collector: Arc<Self>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> Result<JoinHandle<()>, CollectorError> {
        if collector.started.swap(true, Ordering::SeqCst) {
            return Err(CollectorError::AlreadyStarted);
        }

        // Subscribe before spawning so a stop() racing the spawn is not missed
        let shutdown_rx = collector.notify_shutdown.subscribe();

        Ok(tokio::spawn(collector.run(shutdown_rx, shutdown_complete_tx)))
    }

    /// Signal the flush loop to exit. Safe to call any number of times.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            info!("Stopping stats collector");
        }
        // No receivers just means the loop is not running
        let _ = self.notify_shutdown.send(ShutdownMessage::ShutdownAll);
    }

    async fn run(
        self: Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<ShutdownMessage>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) {
        let period_secs = self.config.period_secs;
        let mut prev_index = period_index(unix_timestamp(), period_secs);

        info!(
            "Started stats collector: period={}s, retention={}s, share_difficulty={}",
            period_secs, self.config.retention_secs, self.config.share_difficulty
        );

        while !self.stopped.load(Ordering::SeqCst) {
            let wait = until_next_boundary(unix_timestamp_millis(), period_secs);

            tokio::select! {
                biased;
                message = shutdown_rx.recv() => {
                    debug!("Stats collector received shutdown signal: {:?}", message);
                    break;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            // Index only moves forward; a clock stepping back waits for it to catch up
            let current_index = period_index(unix_timestamp(), period_secs);
            if !crossed_boundary(prev_index, current_index) {
                continue;
            }
            prev_index = current_index;

            self.flush(current_index * period_secs).await;
        }

        info!("Stopped stats collector");
        drop(shutdown_complete_tx);
    }

    /// Drain the accumulator into one batch stamped with the bucket of
    /// `boundary_timestamp`, then prune old rows.
    ///
    /// Buckets are flushed at most once and in increasing order. A bucket at
    /// or before the last flushed one returns `None` and leaves the
    /// accumulator untouched, so its shares go into the next bucket instead
    /// of replacing rows already written.
    ///
    /// Storage failures are logged and the period's rows are dropped.
    pub async fn flush(&self, boundary_timestamp: u64) -> Option<FlushSummary> {
        let period_secs = self.config.period_secs;
        let timestamp = bucket_start(boundary_timestamp, period_secs);

        {
            let mut last_flushed = self.last_flushed_bucket.lock();
            if let Some(last) = *last_flushed {
                if timestamp <= last {
                    warn!(
                        "Skipping flush for bucket {}: bucket {} already flushed",
                        timestamp, last
                    );
                    return None;
                }
            }
            *last_flushed = Some(timestamp);
        }

        let rows: Vec<PersistedStat> = self
            .accumulator
            .snapshot_and_clear()
            .into_iter()
            .map(|(worker_name, pending)| {
                let hashrate = effective_hashrate(
                    pending.valid_shares,
                    self.config.share_difficulty,
                    period_secs,
                );
                PersistedStat::from_pending(worker_name, pending, hashrate, timestamp)
            })
            .collect();

        let total_effective_hashrate: f64 = rows.iter().map(|row| row.effective_hashrate).sum();

        let persisted = if rows.is_empty() {
            debug!("No worker activity for bucket {}", timestamp);
            true
        } else {
            match self.storage.write_batch(&rows).await {
                Ok(()) => true,
                Err(e) => {
                    error!(
                        "Failed to write stats batch for bucket {} ({} workers), dropping it: {}",
                        timestamp,
                        rows.len(),
                        e
                    );
                    false
                }
            }
        };

        if persisted {
            info!(
                "Collected stats for bucket {}: workers={}, effective_hashrate={}",
                timestamp,
                rows.len(),
                format_hashrate(total_effective_hashrate)
            );
        }

        let pruned = match self.storage.prune(self.config.retention_secs).await {
            Ok(removed) => Some(removed),
            Err(e) => {
                warn!(
                    "Failed to prune stats older than {}s: {}",
                    self.config.retention_secs, e
                );
                None
            }
        };

        Some(FlushSummary {
            timestamp,
            workers: rows.len(),
            total_effective_hashrate,
            persisted,
            pruned,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Result as StorageResult, StorageError};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingStorage {
        batches: Mutex<Vec<Vec<PersistedStat>>>,
        prunes: Mutex<Vec<u64>>,
        fail_writes: AtomicBool,
        fail_prunes: AtomicBool,
    }

    impl RecordingStorage {
        fn batches(&self) -> Vec<Vec<PersistedStat>> {
            self.batches.lock().clone()
        }
    }

    #[async_trait::async_trait]
    impl StatsStorage for RecordingStorage {
        async fn write_batch(&self, rows: &[PersistedStat]) -> StorageResult<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StorageError::InvalidArgument("write rejected".to_string()));
            }
            self.batches.lock().push(rows.to_vec());
            Ok(())
        }

        async fn prune(&self, retention_secs: u64) -> StorageResult<u64> {
            if self.fail_prunes.load(Ordering::SeqCst) {
                return Err(StorageError::InvalidArgument("prune rejected".to_string()));
            }
            self.prunes.lock().push(retention_secs);
            Ok(0)
        }
    }

    fn collector_with(config: CollectorConfig) -> (Arc<StatsCollector>, Arc<RecordingStorage>) {
        let storage = Arc::new(RecordingStorage::default());
        let collector = StatsCollector::new(config, storage.clone()).unwrap();
        (Arc::new(collector), storage)
    }

    fn hourly_config() -> CollectorConfig {
        // Long period so the loop never reaches a boundary during a test
        CollectorConfig {
            period_secs: 3600,
            retention_secs: 86_400,
            share_difficulty: 1000.0,
        }
    }

    #[test]
    fn test_default_config() {
        let config = CollectorConfig::new(1000.0);
        assert_eq!(config.period_secs, 60);
        assert_eq!(config.retention_secs, 86_400);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_period() {
        let config = CollectorConfig {
            period_secs: 0,
            ..CollectorConfig::new(1000.0)
        };
        let result = StatsCollector::new(config, Arc::new(RecordingStorage::default()));
        assert!(matches!(
            result,
            Err(CollectorError::Config(ConfigError::InvalidPeriod(0)))
        ));
    }

    #[test]
    fn test_rejects_non_positive_difficulty() {
        for difficulty in [0.0, -5.0, f64::NAN, f64::INFINITY] {
            let result = StatsCollector::new(
                CollectorConfig::new(difficulty),
                Arc::new(RecordingStorage::default()),
            );
            assert!(matches!(
                result,
                Err(CollectorError::Config(ConfigError::InvalidShareDifficulty(_)))
            ));
        }
    }

    #[test]
    fn test_rejects_retention_shorter_than_period() {
        for retention_secs in [0, 59] {
            let config = CollectorConfig {
                retention_secs,
                ..CollectorConfig::new(1000.0)
            };
            assert_eq!(
                config.validate(),
                Err(ConfigError::InvalidRetention {
                    retention_secs,
                    period_secs: 60,
                })
            );
        }
    }

    #[tokio::test]
    async fn test_flush_single_worker() {
        let (collector, storage) = collector_with(CollectorConfig::new(1000.0));
        collector.record("rig1", 10, 0, 0, 500.0, "1.2.3.4");

        let summary = collector.flush(6000).await.unwrap();

        assert_eq!(summary.timestamp, 6000);
        assert_eq!(summary.workers, 1);
        assert!(summary.persisted);
        assert_eq!(summary.pruned, Some(0));
        assert!((summary.total_effective_hashrate - 166.67).abs() < 0.01);

        let batches = storage.batches();
        assert_eq!(batches.len(), 1);
        let row = &batches[0][0];
        assert_eq!(row.worker_name, "rig1");
        assert_eq!(row.valid_share_count, 10);
        assert_eq!(row.reported_hashrate, 500.0);
        assert_eq!(row.ip_address, "1.2.3.4");
        assert!((row.effective_hashrate - 10.0 * 1000.0 / 60.0).abs() < 1e-9);

        assert!(collector.accumulator().is_empty());
        assert_eq!(*storage.prunes.lock(), vec![86_400]);
    }

    #[tokio::test]
    async fn test_flush_aligns_timestamp_to_bucket() {
        let (collector, storage) = collector_with(CollectorConfig::new(1000.0));
        collector.record("rig1", 1, 0, 0, 0.0, "1.2.3.4");

        let summary = collector.flush(6075).await.unwrap();

        assert_eq!(summary.timestamp, 6060);
        assert_eq!(storage.batches()[0][0].timestamp % 60, 0);
    }

    #[tokio::test]
    async fn test_flush_writes_only_active_workers() {
        let (collector, storage) = collector_with(CollectorConfig::new(1000.0));
        collector.record("rig1", 3, 0, 0, 100.0, "10.0.0.1");
        collector.record("rig2", 6, 1, 0, 200.0, "10.0.0.2");
        collector.record("rig2", 6, 0, 1, 250.0, "10.0.0.2");

        let first = collector.flush(6060).await.unwrap();
        assert_eq!(first.workers, 2);

        collector.record("rig2", 60, 0, 0, 300.0, "10.0.0.2");
        let second = collector.flush(6120).await.unwrap();
        assert_eq!(second.workers, 1);

        let batches = storage.batches();
        assert_eq!(batches.len(), 2);

        let mut first_rows = batches[0].clone();
        first_rows.sort_by(|a, b| a.worker_name.cmp(&b.worker_name));
        assert_eq!(first_rows[0].worker_name, "rig1");
        assert_eq!(first_rows[1].worker_name, "rig2");
        assert_eq!(first_rows[1].valid_share_count, 12);
        assert_eq!(first_rows[1].stale_share_count, 1);
        assert_eq!(first_rows[1].invalid_share_count, 1);
        assert_eq!(first_rows[1].reported_hashrate, 250.0);

        assert_eq!(batches[1].len(), 1);
        assert_eq!(batches[1][0].worker_name, "rig2");
        assert_eq!(batches[1][0].timestamp, 6120);
        assert_eq!(batches[1][0].effective_hashrate, 1000.0);
    }

    #[tokio::test]
    async fn test_empty_flush_skips_write_but_prunes() {
        let (collector, storage) = collector_with(CollectorConfig::new(1000.0));

        let summary = collector.flush(6000).await.unwrap();

        assert_eq!(summary.workers, 0);
        assert_eq!(summary.total_effective_hashrate, 0.0);
        assert!(storage.batches().is_empty());
        assert_eq!(storage.prunes.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_drops_period_and_continues() {
        let (collector, storage) = collector_with(CollectorConfig::new(1000.0));
        storage.fail_writes.store(true, Ordering::SeqCst);
        collector.record("rig1", 10, 0, 0, 500.0, "1.2.3.4");

        let failed = collector.flush(6000).await.unwrap();
        assert!(!failed.persisted);
        assert_eq!(failed.workers, 1);
        assert!(collector.accumulator().is_empty());
        assert!(storage.batches().is_empty());

        storage.fail_writes.store(false, Ordering::SeqCst);
        collector.record("rig1", 4, 0, 0, 500.0, "1.2.3.4");

        let recovered = collector.flush(6060).await.unwrap();
        assert!(recovered.persisted);
        let batches = storage.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].valid_share_count, 4);
    }

    #[tokio::test]
    async fn test_failed_prune_is_reported() {
        let (collector, storage) = collector_with(CollectorConfig::new(1000.0));
        storage.fail_prunes.store(true, Ordering::SeqCst);
        collector.record("rig1", 10, 0, 0, 500.0, "1.2.3.4");

        let summary = collector.flush(6000).await.unwrap();

        assert!(summary.persisted);
        assert_eq!(summary.pruned, None);
        assert_eq!(storage.batches().len(), 1);
    }

    #[tokio::test]
    async fn test_bucket_is_flushed_once() {
        let (collector, storage) = collector_with(CollectorConfig::new(1000.0));
        collector.record("rig1", 10, 0, 0, 500.0, "1.2.3.4");
        assert!(collector.flush(6060).await.is_some());

        // Same bucket again, then an older one after the clock stepped back
        collector.record("rig1", 3, 0, 0, 500.0, "1.2.3.4");
        assert!(collector.flush(6060).await.is_none());
        assert!(collector.flush(6075).await.is_none());
        assert!(collector.flush(6000).await.is_none());

        assert_eq!(storage.batches().len(), 1);
        assert_eq!(storage.prunes.lock().len(), 1);
        assert_eq!(collector.accumulator().len(), 1);

        let summary = collector.flush(6120).await.unwrap();
        assert_eq!(summary.timestamp, 6120);

        let batches = storage.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0][0].timestamp, 6060);
        assert_eq!(batches[0][0].valid_share_count, 10);
        assert_eq!(batches[1][0].timestamp, 6120);
        assert_eq!(batches[1][0].valid_share_count, 3);
    }

    #[tokio::test]
    async fn test_loop_flushes_once_per_boundary() {
        let config = CollectorConfig {
            period_secs: 1,
            retention_secs: 3600,
            share_difficulty: 1000.0,
        };
        let (collector, storage) = collector_with(config);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

        // Start just after a boundary so each check lands mid-period
        let wait = until_next_boundary(unix_timestamp_millis(), 1);
        tokio::time::sleep(wait + Duration::from_millis(50)).await;
        let base = tokio::time::Instant::now();
        let handle = StatsCollector::start(collector.clone(), shutdown_complete_tx).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(storage.prunes.lock().is_empty());
        assert!(storage.batches().is_empty());

        collector.record("rig1", 2, 0, 0, 500.0, "1.2.3.4");
        tokio::time::sleep_until(base + Duration::from_millis(1500)).await;
        assert_eq!(storage.prunes.lock().len(), 1);
        assert_eq!(storage.batches().len(), 1);

        collector.record("rig1", 4, 0, 0, 500.0, "1.2.3.4");
        tokio::time::sleep_until(base + Duration::from_millis(2500)).await;
        assert_eq!(storage.prunes.lock().len(), 2);
        let batches = storage.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0][0].valid_share_count, 2);
        assert_eq!(batches[1][0].valid_share_count, 4);
        assert_eq!(batches[1][0].timestamp, batches[0][0].timestamp + 1);

        // Idle period still prunes but writes nothing
        tokio::time::sleep_until(base + Duration::from_millis(3500)).await;
        assert_eq!(*storage.prunes.lock(), vec![3600, 3600, 3600]);
        assert_eq!(storage.batches().len(), 2);

        collector.stop();
        let completed =
            tokio::time::timeout(Duration::from_secs(1), shutdown_complete_rx.recv()).await;
        assert_eq!(completed, Ok(None));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_while_idle_exits_without_writes() {
        let (collector, storage) = collector_with(hourly_config());
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

        let handle = StatsCollector::start(collector.clone(), shutdown_complete_tx).unwrap();
        collector.record("rig1", 10, 0, 0, 500.0, "1.2.3.4");
        tokio::time::sleep(Duration::from_millis(50)).await;

        collector.stop();

        let completed =
            tokio::time::timeout(Duration::from_secs(1), shutdown_complete_rx.recv()).await;
        assert_eq!(completed, Ok(None));
        handle.await.unwrap();

        assert!(storage.batches().is_empty());
        assert!(storage.prunes.lock().is_empty());
        // The open period is neither flushed nor cleared
        assert_eq!(collector.accumulator().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (collector, _storage) = collector_with(hourly_config());
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

        let handle = StatsCollector::start(collector.clone(), shutdown_complete_tx).unwrap();
        collector.stop();
        collector.stop();
        collector.stop();

        let completed =
            tokio::time::timeout(Duration::from_secs(1), shutdown_complete_rx.recv()).await;
        assert_eq!(completed, Ok(None));
        handle.await.unwrap();

        collector.stop();
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let (collector, storage) = collector_with(hourly_config());
        collector.stop();

        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);
        let handle = StatsCollector::start(collector.clone(), shutdown_complete_tx).unwrap();

        let completed =
            tokio::time::timeout(Duration::from_secs(1), shutdown_complete_rx.recv()).await;
        assert_eq!(completed, Ok(None));
        handle.await.unwrap();
        assert!(storage.batches().is_empty());
    }

    #[tokio::test]
    async fn test_host_shutdown_sender_stops_loop() {
        let (collector, _storage) = collector_with(hourly_config());
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

        let handle = StatsCollector::start(collector.clone(), shutdown_complete_tx).unwrap();
        collector
            .shutdown_sender()
            .send(ShutdownMessage::ShutdownAll)
            .unwrap();

        let completed =
            tokio::time::timeout(Duration::from_secs(1), shutdown_complete_rx.recv()).await;
        assert_eq!(completed, Ok(None));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (collector, _storage) = collector_with(hourly_config());
        let (shutdown_complete_tx, _shutdown_complete_rx) = mpsc::channel::<()>(1);

        let handle = StatsCollector::start(collector.clone(), shutdown_complete_tx.clone()).unwrap();
        let second = StatsCollector::start(collector.clone(), shutdown_complete_tx);
        assert!(matches!(second, Err(CollectorError::AlreadyStarted)));

        collector.stop();
        handle.await.unwrap();
    }
}
