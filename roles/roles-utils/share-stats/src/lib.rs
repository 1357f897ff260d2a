//! Per-worker share statistics for the pool.
//!
//! Share producers record valid/stale/invalid counts into an in-memory
//! accumulator; a [`StatsCollector`] flushes them once per period into
//! bucketed effective-hashrate rows and prunes rows past the retention
//! horizon.

pub mod accumulator;
pub mod bucketing;
pub mod collector;
pub mod error;
pub mod metrics;
pub mod storage;
pub mod types;

pub use accumulator::Accumulator;
pub use collector::{CollectorConfig, FlushSummary, ShutdownMessage, StatsCollector};
pub use error::{CollectorError, ConfigError};
pub use metrics::effective_hashrate;
pub use storage::{SqliteStorage, StatsStorage, StorageError};
pub use types::{unix_timestamp, PendingStat, PersistedStat};
