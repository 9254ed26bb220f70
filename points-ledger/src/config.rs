//! Configuration for the ledger

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Store backend selection
    pub store: StoreConfig,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Defaults for the settings row and token seeding
    pub ledger: LedgerDefaults,

    /// Retry policy for conflicting or failed commits
    pub retry: RetryConfig,

    /// Live feed configuration
    pub feed: FeedConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/points-ledger"),
            service_name: "points-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            store: StoreConfig::default(),
            rocksdb: RocksDBConfig::default(),
            ledger: LedgerDefaults::default(),
            retry: RetryConfig::default(),
            feed: FeedConfig::default(),
        }
    }
}

/// Which store implementation backs the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Durable RocksDB store under `data_dir`
    RocksDb,
    /// In-process store for demo and offline mode (lost on exit)
    Memory,
}

impl StoreBackend {
    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rocksdb" => Some(StoreBackend::RocksDb),
            "memory" => Some(StoreBackend::Memory),
            _ => None,
        }
    }
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend
    pub backend: StoreBackend,

    /// Upper bound for a single store call (milliseconds)
    pub op_timeout_ms: u64,

    /// Capacity of the change-notification channel
    pub change_buffer: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::RocksDb,
            op_timeout_ms: 2_000,
            change_buffer: 1024,
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Sync WAL on every commit
    pub sync_writes: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 3,
            max_background_jobs: 2,
            sync_writes: true,
        }
    }
}

/// Initial values for the settings row
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerDefaults {
    /// Points charged per vote
    pub vote_cost: i64,

    /// Points granted to a new account
    pub starting_points: i64,

    /// Whether voting starts enabled
    pub voting_enabled: bool,

    /// Register the default token set on open
    pub seed_default_tokens: bool,
}

impl Default for LedgerDefaults {
    fn default() -> Self {
        Self {
            vote_cost: 10,
            starting_points: 1000,
            voting_enabled: true,
            seed_default_tokens: false,
        }
    }
}

/// Retry configuration (exponential backoff with jitter)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry (milliseconds)
    pub initial_delay_ms: u64,

    /// Delay cap (milliseconds)
    pub max_delay_ms: u64,

    /// Growth factor per attempt
    pub backoff_multiplier: f64,

    /// Fraction of the delay randomised either way
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 20,
            max_delay_ms: 500,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// How feed subscriptions learn about new votes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedMode {
    /// Store change notifications, polling only as fallback
    Push,
    /// Always poll (degraded mode)
    Poll,
}

/// Live feed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Default number of entries in a snapshot
    pub default_limit: usize,

    /// Poll interval in degraded mode (milliseconds)
    pub poll_interval_ms: u64,

    /// Delivery mode
    pub mode: FeedMode,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            default_limit: 20,
            poll_interval_ms: 2_000,
            mode: FeedMode::Push,
        }
    }
}

impl Config {
    /// In-memory configuration, used by tests and demo mode
    pub fn in_memory() -> Self {
        let mut config = Config::default();
        config.store.backend = StoreBackend::Memory;
        config
    }

    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(backend) = std::env::var("LEDGER_STORE_BACKEND") {
            config.store.backend = StoreBackend::parse(&backend).ok_or_else(|| {
                crate::Error::Config(format!("Unknown store backend: {}", backend))
            })?;
        }

        if let Ok(cost) = std::env::var("LEDGER_VOTE_COST") {
            config.ledger.vote_cost = parse_env("LEDGER_VOTE_COST", &cost)?;
        }

        if let Ok(points) = std::env::var("LEDGER_STARTING_POINTS") {
            config.ledger.starting_points = parse_env("LEDGER_STARTING_POINTS", &points)?;
        }

        if let Ok(interval) = std::env::var("LEDGER_FEED_POLL_MS") {
            config.feed.poll_interval_ms = parse_env("LEDGER_FEED_POLL_MS", &interval)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the ledger cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.ledger.vote_cost <= 0 {
            return Err(crate::Error::Config("vote_cost must be positive".to_string()));
        }
        if self.ledger.starting_points < 0 {
            return Err(crate::Error::Config(
                "starting_points must not be negative".to_string(),
            ));
        }
        if self.store.op_timeout_ms == 0 {
            return Err(crate::Error::Config("op_timeout_ms must be positive".to_string()));
        }
        if self.feed.poll_interval_ms == 0 {
            return Err(crate::Error::Config(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.store.change_buffer == 0 {
            return Err(crate::Error::Config("change_buffer must be positive".to_string()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> crate::Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| crate::Error::Config(format!("Invalid {}: {}", key, e)))
}
