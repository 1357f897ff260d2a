use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

mod config;

use config::Config;
use share_stats::{SqliteStorage, StatsCollector};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_args()?;
    info!("Starting stats-collector service");
    info!("Stats database: {}", config.db_path);

    let storage = Arc::new(SqliteStorage::new(&config.db_path).await?);
    let collector = Arc::new(StatsCollector::new(config.collector, storage)?);

    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);
    let handle = StatsCollector::start(collector.clone(), shutdown_complete_tx)?;

    tokio::signal::ctrl_c().await?;
    info!("Ctrl+C received, initiating graceful shutdown...");
    collector.stop();

    let shutdown_timeout = tokio::time::Duration::from_secs(5);
    tokio::select! {
        _ = shutdown_complete_rx.recv() => {
            info!("Stats collector reported shutdown complete.");
        }
        _ = tokio::time::sleep(shutdown_timeout) => {
            warn!("Graceful shutdown timed out after {shutdown_timeout:?}, aborting collector.");
            handle.abort();
        }
    }

    info!("stats-collector shutdown complete.");
    Ok(())
}
