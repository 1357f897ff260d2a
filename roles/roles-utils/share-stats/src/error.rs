use thiserror::Error;

use crate::storage::StorageError;

/// Rejected collector settings. Raised before the flush loop starts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid period length: {0} seconds")]
    InvalidPeriod(u64),

    #[error("Invalid share difficulty: {0}")]
    InvalidShareDifficulty(f64),

    #[error("Invalid retention horizon: {retention_secs} seconds (period is {period_secs} seconds)")]
    InvalidRetention { retention_secs: u64, period_secs: u64 },
}

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Stats collector already started")]
    AlreadyStarted,
}
