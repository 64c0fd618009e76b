//! Configuration for the ingest node
//!
//! Every field has a serde default so a partial TOML file is enough.

use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Write dispatch and worker pool tuning
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Durability configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Metrics and monitoring
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Write dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Number of write worker slots (0 = one per CPU)
    #[serde(default)]
    pub worker_threads: usize,

    /// Back-off applied by a worker whose drain came back empty, in microseconds
    #[serde(default = "default_idle_backoff_us")]
    pub idle_backoff_us: u64,

    /// Upper bound on items taken in one drain (0 = everything pending)
    #[serde(default)]
    pub max_batch_items: usize,
}

/// Which write-ahead log backs the vnodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalKind {
    /// In-memory log, nothing survives a restart
    Memory,
    /// Append-only file per vnode under `data_dir`
    File,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Data directory path
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Log backend
    #[serde(default = "default_wal_kind")]
    pub wal: WalKind,

    /// Issue `fdatasync` on every batch flush
    #[serde(default = "default_fsync")]
    pub fsync: bool,
}

/// Metrics configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable Prometheus metrics
    #[serde(default)]
    pub enable_prometheus: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            idle_backoff_us: default_idle_backoff_us(),
            max_batch_items: 0,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            wal: default_wal_kind(),
            fsync: default_fsync(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default value functions for serde
fn default_idle_backoff_us() -> u64 { 100 }
fn default_data_dir() -> PathBuf { PathBuf::from("./data") }
fn default_wal_kind() -> WalKind { WalKind::Memory }
fn default_fsync() -> bool { true }
fn default_log_level() -> String { "info".to_string() }

impl DispatchConfig {
    /// Resolved worker slot count
    pub fn worker_slots(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get().max(1)
        } else {
            self.worker_threads
        }
    }

    /// Idle back-off as a duration
    pub fn idle_backoff(&self) -> Duration {
        Duration::from_micros(self.idle_backoff_us)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the node cannot run with
    pub fn validate(&self) -> Result<()> {
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config(format!(
                "invalid log level '{}', expected one of {:?}",
                self.logging.level, LEVELS
            )));
        }
        if self.dispatch.idle_backoff_us > 1_000_000 {
            return Err(Error::config("dispatch.idle_backoff_us must be at most one second"));
        }
        Ok(())
    }
}

/// Load configuration from file or use defaults
pub fn load_config_or_default(path: Option<&str>) -> Config {
    match path {
        Some(path) => match Config::from_file(path) {
            Ok(config) => {
                info!("Loaded configuration from: {}", path);
                config
            }
            Err(e) => {
                warn!("Failed to load config from {}: {}. Using defaults.", path, e);
                Config::default()
            }
        },
        None => {
            info!("No config file specified, using defaults");
            Config::default()
        }
    }
}
