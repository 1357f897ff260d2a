//! SQLite storage backend for bucketed worker stats.

use crate::types::{unix_timestamp, PersistedStat};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage abstraction for worker stats rows.
#[async_trait::async_trait]
pub trait StatsStorage: Send + Sync {
    /// Write all rows of one period as a single atomic batch.
    ///
    /// Rows are keyed by `(worker_name, timestamp)`; writing an existing key
    /// replaces it.
    async fn write_batch(&self, rows: &[PersistedStat]) -> Result<()>;

    /// Delete every row older than `now - retention_secs`.
    ///
    /// Returns the number of rows removed.
    async fn prune(&self, retention_secs: u64) -> Result<u64>;
}

/// SQLite-backed storage implementation.
pub struct SqliteStorage {
    pool: Pool<Sqlite>,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance.
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();

        // Create parent directories if they don't exist
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let connection_options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
                .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connection_options)
            .await?;

        let storage = Self { pool };
        storage.init_schema().await?;

        Ok(storage)
    }

    /// Initialize the database schema.
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS worker_stats (
                worker_name TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                valid_shares INTEGER NOT NULL,
                stale_shares INTEGER NOT NULL,
                invalid_shares INTEGER NOT NULL,
                reported_hashrate REAL NOT NULL,
                effective_hashrate REAL NOT NULL,
                ip_address TEXT NOT NULL,

                PRIMARY KEY (worker_name, timestamp)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Pruning scans by age
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_worker_stats_timestamp
            ON worker_stats(timestamp)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete every row with a timestamp strictly before `cutoff`.
    pub async fn prune_older_than(&self, cutoff: u64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM worker_stats WHERE timestamp < ?")
            .bind(cutoff as i64)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Load all rows with `from_timestamp <= timestamp <= to_timestamp`,
    /// ordered by timestamp then worker name.
    pub async fn query_stats(
        &self,
        from_timestamp: u64,
        to_timestamp: u64,
    ) -> Result<Vec<PersistedStat>> {
        if from_timestamp > to_timestamp {
            return Err(StorageError::InvalidArgument(format!(
                "from_timestamp {} is after to_timestamp {}",
                from_timestamp, to_timestamp
            )));
        }

        let rows = sqlx::query(
            r#"
            SELECT
                worker_name,
                timestamp,
                valid_shares,
                stale_shares,
                invalid_shares,
                reported_hashrate,
                effective_hashrate,
                ip_address
            FROM worker_stats
            WHERE timestamp >= ? AND timestamp <= ?
            ORDER BY timestamp ASC, worker_name ASC
            "#,
        )
        .bind(from_timestamp as i64)
        .bind(to_timestamp as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| PersistedStat {
                worker_name: row.get::<String, _>("worker_name"),
                valid_share_count: row.get::<i64, _>("valid_shares") as u64,
                stale_share_count: row.get::<i64, _>("stale_shares") as u64,
                invalid_share_count: row.get::<i64, _>("invalid_shares") as u64,
                reported_hashrate: row.get::<f64, _>("reported_hashrate"),
                effective_hashrate: row.get::<f64, _>("effective_hashrate"),
                ip_address: row.get::<String, _>("ip_address"),
                timestamp: row.get::<i64, _>("timestamp") as u64,
            })
            .collect())
    }
}

#[async_trait::async_trait]
impl StatsStorage for SqliteStorage {
    async fn write_batch(&self, rows: &[PersistedStat]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // Counters are stored as i64 for SQLite
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO worker_stats
                (worker_name, timestamp, valid_shares, stale_shares, invalid_shares,
                 reported_hashrate, effective_hashrate, ip_address)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(worker_name, timestamp) DO UPDATE SET
                    valid_shares = excluded.valid_shares,
                    stale_shares = excluded.stale_shares,
                    invalid_shares = excluded.invalid_shares,
                    reported_hashrate = excluded.reported_hashrate,
                    effective_hashrate = excluded.effective_hashrate,
                    ip_address = excluded.ip_address
                "#,
            )
            .bind(&row.worker_name)
            .bind(row.timestamp as i64)
            .bind(row.valid_share_count as i64)
            .bind(row.stale_share_count as i64)
            .bind(row.invalid_share_count as i64)
            .bind(row.reported_hashrate)
            .bind(row.effective_hashrate)
            .bind(&row.ip_address)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::debug!("Stored stats batch: rows={}", rows.len());

        Ok(())
    }

    async fn prune(&self, retention_secs: u64) -> Result<u64> {
        let cutoff = unix_timestamp().saturating_sub(retention_secs);
        let removed = self.prune_older_than(cutoff).await?;

        if removed > 0 {
            tracing::debug!("Pruned {} stats rows older than {}", removed, cutoff);
        }

        Ok(removed)
    }
}
