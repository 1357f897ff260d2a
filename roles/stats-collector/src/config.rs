use serde::Deserialize;
use share_stats::collector::{DEFAULT_PERIOD_SECS, DEFAULT_RETENTION_SECS};
use share_stats::CollectorConfig;
use std::{env, fs};

const DEFAULT_DB_PATH: &str = ".devenv/state/stats-collector/stats.db";

#[derive(Debug, Clone)]
pub struct Config {
    pub collector: CollectorConfig,
    pub db_path: String,
}

#[derive(Debug, Default, Deserialize)]
struct StatsCollectorConfig {
    #[serde(default)]
    collector: CollectorSection,
    #[serde(default)]
    storage: StorageSection,
}

#[derive(Debug, Deserialize)]
struct CollectorSection {
    period_secs: Option<u64>,
    retention_secs: Option<u64>,
    share_difficulty: Option<f64>,
}

impl Default for CollectorSection {
    fn default() -> Self {
        Self {
            period_secs: Some(DEFAULT_PERIOD_SECS),
            retention_secs: Some(DEFAULT_RETENTION_SECS),
            share_difficulty: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StorageSection {
    db_path: Option<String>,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: Some(DEFAULT_DB_PATH.to_string()),
        }
    }
}

fn arg_value(args: &[String], names: &[&str]) -> Option<String> {
    args.iter()
        .position(|arg| names.contains(&arg.as_str()))
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn parse_arg<T: std::str::FromStr>(
    args: &[String],
    names: &[&str],
) -> Result<Option<T>, Box<dyn std::error::Error>> {
    match arg_value(args, names) {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| format!("Invalid value for {}: {}", names[0], value).into()),
        None => Ok(None),
    }
}

impl Config {
    pub fn from_args() -> Result<Self, Box<dyn std::error::Error>> {
        let args: Vec<String> = env::args().collect();
        Self::from_arg_list(&args)
    }

    /// Build the config from a config file plus CLI overrides.
    ///
    /// A missing or empty config file falls back to defaults. The share
    /// difficulty has no default and must come from one of the two.
    pub fn from_arg_list(args: &[String]) -> Result<Self, Box<dyn std::error::Error>> {
        let file_config = match arg_value(args, &["--config", "-c"]) {
            Some(path) => {
                let contents = fs::read_to_string(&path).unwrap_or_default();
                Self::parse_file(&contents)?
            }
            None => StatsCollectorConfig::default(),
        };

        let share_difficulty = parse_arg::<f64>(args, &["--share-difficulty", "-d"])?
            .or(file_config.collector.share_difficulty)
            .ok_or("Missing required config: collector.share_difficulty")?;

        let period_secs = parse_arg::<u64>(args, &["--period-secs"])?
            .or(file_config.collector.period_secs)
            .unwrap_or(DEFAULT_PERIOD_SECS);

        let retention_secs = parse_arg::<u64>(args, &["--retention-secs"])?
            .or(file_config.collector.retention_secs)
            .unwrap_or(DEFAULT_RETENTION_SECS);

        let db_path = arg_value(args, &["--db-path"])
            .or(file_config.storage.db_path)
            .unwrap_or_else(|| DEFAULT_DB_PATH.to_string());

        let collector = CollectorConfig {
            period_secs,
            retention_secs,
            share_difficulty,
        };
        collector.validate()?;

        Ok(Config { collector, db_path })
    }

    fn parse_file(contents: &str) -> Result<StatsCollectorConfig, toml::de::Error> {
        if contents.trim().is_empty() {
            Ok(StatsCollectorConfig::default())
        } else {
            toml::from_str(contents)
        }
    }
}
