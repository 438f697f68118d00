//! Server Configuration
//!
//! Loaded from TOML (`ServerConfig::from_file`), then overridden by
//! `CISTERN_*` environment variables (`ServerConfig::from_env`). Durations
//! are serialized as milliseconds.
//!
//! | Variable | Field |
//! |----------|-------|
//! | `CISTERN_CONFIG` | TOML file loaded before overrides |
//! | `CISTERN_DATA_DIR` | `data_dir` |
//! | `CISTERN_LISTEN_ADDR` | `listen_addr` |
//! | `CISTERN_CLUSTER_ID` | `cluster_id` |
//! | `CISTERN_METRICS_ADDR` | `metrics_addr` |
//! | `CISTERN_METRICS_INTERVAL_MS` | `metrics_interval` |
//! | `CISTERN_SYNC_WRITES` | `store.sync_writes` |
//! | `CISTERN_POLL_INTERVAL_MS` | `publisher.poll_interval` |
//! | `CISTERN_SAVEPOINT_BATCH` | `publisher.savepoint_batch` |
//! | `CISTERN_INITIAL_COMMIT_TS` | `publisher.initial_commit_ts` |

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error type for configuration loading
#[derive(Debug)]
pub enum ConfigError {
    /// Config file could not be read
    Io { path: PathBuf, source: std::io::Error },
    /// Config file is not valid TOML for `ServerConfig`
    Parse { path: PathBuf, message: String },
    /// Environment variable has an unparseable value
    Env { var: &'static str, value: String },
    /// Configuration is inconsistent
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "cannot read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, message } => {
                write!(f, "invalid config {}: {}", path.display(), message)
            }
            ConfigError::Env { var, value } => write!(f, "invalid value {:?} for {}", value, var),
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Store settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// fsync every write batch before acknowledging it
    pub sync_writes: bool,
    /// Records fetched per scan page
    pub scan_page_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            sync_writes: true,
            scan_page_size: crate::store::DEFAULT_SCAN_PAGE_SIZE,
        }
    }
}

/// Collector settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Bounded channel size between a producer handle and its task
    pub channel_capacity: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        CollectorConfig {
            channel_capacity: 1024,
        }
    }
}

/// Delivery retry policy for the publisher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Time allowed for one delivery attempt
    #[serde(with = "duration_millis")]
    pub attempt_timeout: Duration,
    /// Backoff after the first failure
    #[serde(with = "duration_millis")]
    pub initial_backoff: Duration,
    /// Backoff ceiling
    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,
    /// Give up after this many attempts; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempt_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Backoff to sleep after `failures` consecutive failed attempts (>= 1)
    pub fn backoff(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }

    /// Whether another attempt is allowed after `failures` failed ones
    pub fn allows(&self, failures: u32) -> bool {
        self.max_attempts.map_or(true, |max| failures < max)
    }

    /// Fast retries for tests
    pub fn test() -> Self {
        RetryPolicy {
            attempt_timeout: Duration::from_millis(200),
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            max_attempts: Some(5),
        }
    }
}

/// Publisher settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Idle wait when no window notification arrives
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    /// Persist the save point after this many confirmed deliveries
    pub savepoint_batch: usize,
    /// Save point used when none is persisted
    pub initial_commit_ts: i64,
    pub retry: RetryPolicy,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        PublisherConfig {
            poll_interval: Duration::from_secs(1),
            savepoint_batch: 1,
            initial_commit_ts: 0,
            retry: RetryPolicy::default(),
        }
    }
}

impl PublisherConfig {
    pub fn test() -> Self {
        PublisherConfig {
            poll_interval: Duration::from_millis(10),
            savepoint_batch: 1,
            initial_commit_ts: 0,
            retry: RetryPolicy::test(),
        }
    }
}

/// Top-level server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Directory holding the store file
    pub data_dir: PathBuf,
    /// Address the RPC front end binds to
    pub listen_addr: String,
    /// Namespaces the store (`meta_{id}`, `binlog_{id}`, `savepoint_{id}`)
    pub cluster_id: u64,
    /// Metrics endpoint, reported in status logs
    pub metrics_addr: Option<String>,
    /// Interval between status reports
    #[serde(with = "duration_millis")]
    pub metrics_interval: Duration,
    pub store: StoreConfig,
    pub collector: CollectorConfig,
    pub publisher: PublisherConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            data_dir: PathBuf::from("data.cistern"),
            listen_addr: "127.0.0.1:8249".to_string(),
            cluster_id: 1,
            metrics_addr: None,
            metrics_interval: Duration::from_secs(15),
            store: StoreConfig::default(),
            collector: CollectorConfig::default(),
            publisher: PublisherConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Configuration for tests (fast polling, unsynced writes)
    pub fn test(data_dir: impl Into<PathBuf>) -> Self {
        ServerConfig {
            data_dir: data_dir.into(),
            listen_addr: "127.0.0.1:0".to_string(),
            cluster_id: 1,
            metrics_addr: None,
            metrics_interval: Duration::from_millis(100),
            store: StoreConfig {
                sync_writes: false,
                scan_page_size: 16,
            },
            collector: CollectorConfig {
                channel_capacity: 16,
            },
            publisher: PublisherConfig::test(),
        }
    }

    /// Parse a TOML config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Load `CISTERN_CONFIG` (if set), apply `CISTERN_*` overrides, validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("CISTERN_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => ServerConfig::default(),
        };
        config.apply_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `lookup` (variable name to value).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        if let Some(dir) = lookup("CISTERN_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(addr) = lookup("CISTERN_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Some(id) = parse_var(&lookup, "CISTERN_CLUSTER_ID")? {
            self.cluster_id = id;
        }
        if let Some(addr) = lookup("CISTERN_METRICS_ADDR") {
            self.metrics_addr = if addr.is_empty() { None } else { Some(addr) };
        }
        if let Some(ms) = parse_var(&lookup, "CISTERN_METRICS_INTERVAL_MS")? {
            self.metrics_interval = Duration::from_millis(ms);
        }
        if let Some(value) = lookup("CISTERN_SYNC_WRITES") {
            self.store.sync_writes = match value.as_str() {
                "1" | "true" => true,
                "0" | "false" => false,
                _ => {
                    return Err(ConfigError::Env {
                        var: "CISTERN_SYNC_WRITES",
                        value,
                    })
                }
            };
        }
        if let Some(ms) = parse_var(&lookup, "CISTERN_POLL_INTERVAL_MS")? {
            self.publisher.poll_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var(&lookup, "CISTERN_SAVEPOINT_BATCH")? {
            self.publisher.savepoint_batch = n;
        }
        if let Some(ts) = parse_var(&lookup, "CISTERN_INITIAL_COMMIT_TS")? {
            self.publisher.initial_commit_ts = ts;
        }
        Ok(())
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("data_dir is empty".to_string()));
        }
        self.listen_addr.parse::<SocketAddr>().map_err(|e| {
            ConfigError::Invalid(format!("listen_addr {:?}: {}", self.listen_addr, e))
        })?;
        if let Some(addr) = &self.metrics_addr {
            addr.parse::<SocketAddr>()
                .map_err(|e| ConfigError::Invalid(format!("metrics_addr {:?}: {}", addr, e)))?;
        }
        if self.metrics_interval.is_zero() {
            return Err(ConfigError::Invalid("metrics_interval must be positive".to_string()));
        }
        if self.store.scan_page_size == 0 {
            return Err(ConfigError::Invalid("store.scan_page_size must be positive".to_string()));
        }
        if self.collector.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "collector.channel_capacity must be positive".to_string(),
            ));
        }
        let publisher = &self.publisher;
        if publisher.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("publisher.poll_interval must be positive".to_string()));
        }
        if publisher.savepoint_batch == 0 {
            return Err(ConfigError::Invalid(
                "publisher.savepoint_batch must be positive".to_string(),
            ));
        }
        let retry = &publisher.retry;
        if retry.attempt_timeout.is_zero() {
            return Err(ConfigError::Invalid("retry.attempt_timeout must be positive".to_string()));
        }
        if retry.initial_backoff > retry.max_backoff {
            return Err(ConfigError::Invalid(
                "retry.initial_backoff exceeds retry.max_backoff".to_string(),
            ));
        }
        if retry.max_attempts == Some(0) {
            return Err(ConfigError::Invalid("retry.max_attempts must be positive".to_string()));
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&'static str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env { var, value }),
        None => Ok(None),
    }
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
