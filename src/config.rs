//! Node and Stream Configuration
//!
//! `NodeConfig` is loaded from a TOML file and then overridden from the
//! environment:
//!
//! - `TSDB_DATA_DIR`: directory holding the partition index
//! - `TSDB_COMPACTION_THREADS`: compaction worker count
//! - `TSDB_REPLICATION_THREADS`: replication worker count
//!
//! ```toml
//! data_dir = "/var/lib/tsdb"
//!
//! [workers]
//! compaction_threads = 4
//! replication_threads = 2
//!
//! [[namespaces]]
//! name = "metrics"
//!
//! [[namespaces.streams]]
//! stream_key_prefix = "cpu."
//! partition_window = 3600000
//! ```

use crate::index::{DEFAULT_DATA_FILE, DEFAULT_LOCK_FILE, DEFAULT_MAP_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// TigerStyle: Explicit limits with _MAX suffix
pub const WORKER_THREADS_MAX: usize = 64;
pub const PASS_INTERVAL_MS_MIN: u64 = 10;
pub const PASS_INTERVAL_MS_MAX: u64 = 3_600_000;
pub const REPLICATION_FACTOR_MAX: usize = 16;

/// Configuration governing partitions whose stream key matches a prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Stream keys beginning with this prefix use this config
    pub stream_key_prefix: String,
    /// Time bucket covered by one partition (default: 1h)
    #[serde(with = "duration_millis")]
    pub partition_window: Duration,
    /// Target maximum size of a compacted table (default: 64MB)
    pub max_sstable_size: u64,
    /// Minimum spacing between compactions of one partition (default: 60s)
    #[serde(with = "duration_millis")]
    pub compaction_interval: Duration,
    /// Total copies of each partition including the local one (default: 1,
    /// no remote replicas)
    pub replication_factor: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            stream_key_prefix: String::new(),
            partition_window: Duration::from_secs(3600),
            max_sstable_size: 64 * 1024 * 1024, // 64MB
            compaction_interval: Duration::from_secs(60),
            replication_factor: 1,
        }
    }
}

impl StreamConfig {
    pub fn new(stream_key_prefix: impl Into<String>) -> Self {
        StreamConfig {
            stream_key_prefix: stream_key_prefix.into(),
            ..Default::default()
        }
    }

    /// Configuration for tests (compaction always due)
    pub fn test(stream_key_prefix: impl Into<String>) -> Self {
        StreamConfig {
            stream_key_prefix: stream_key_prefix.into(),
            partition_window: Duration::from_secs(60),
            max_sstable_size: 64 * 1024,
            compaction_interval: Duration::ZERO,
            replication_factor: 1,
        }
    }

    pub fn with_replication_factor(mut self, replication_factor: usize) -> Self {
        self.replication_factor = replication_factor.clamp(1, REPLICATION_FACTOR_MAX);
        self
    }
}

/// Index location and sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Upper bound on live index data (default: 1GiB)
    pub map_size_bytes: u64,
    pub data_file: String,
    pub lock_file: String,
    /// Open without taking the lock; writes are rejected
    pub read_only: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            map_size_bytes: DEFAULT_MAP_SIZE,
            data_file: DEFAULT_DATA_FILE.to_string(),
            lock_file: DEFAULT_LOCK_FILE.to_string(),
            read_only: false,
        }
    }
}

/// Background worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub compaction_threads: usize,
    pub replication_threads: usize,
    /// Pause between passes over the directory (default: 1s)
    #[serde(with = "duration_millis")]
    pub pass_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            compaction_threads: 2,
            replication_threads: 1,
            pass_interval: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    /// Configuration for tests (fast passes)
    pub fn test() -> Self {
        WorkerConfig {
            compaction_threads: 1,
            replication_threads: 1,
            pass_interval: Duration::from_millis(PASS_INTERVAL_MS_MIN),
        }
    }
}

/// Replication topology and outbound connection limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Address this node is reachable at (excluded from its own replica set)
    pub local_address: Option<String>,
    /// All replica addresses in the cluster
    pub peers: Vec<String>,
    /// Maximum concurrent outbound replica pushes
    pub max_connections: usize,
    /// Reusable buffers kept by the connection pool
    pub buffer_pool_size: usize,
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig {
            local_address: None,
            peers: Vec::new(),
            max_connections: 64,
            buffer_pool_size: 16,
            connect_timeout: Duration::from_secs(2),
        }
    }
}

/// Stream prefixes registered under one namespace
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamespaceConfig {
    pub name: String,
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
}

/// Error loading configuration
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config I/O error: {}", e),
            ConfigError::Parse(msg) => write!(f, "config parse error: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

/// Top-level node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub index: IndexConfig,
    pub workers: WorkerConfig,
    pub replication: ReplicationConfig,
    pub namespaces: Vec<NamespaceConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            data_dir: PathBuf::from("/var/lib/tsdb"),
            index: IndexConfig::default(),
            workers: WorkerConfig::default(),
            replication: ReplicationConfig::default(),
            namespaces: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Configuration for tests rooted at `data_dir`
    pub fn test(data_dir: PathBuf) -> Self {
        NodeConfig {
            data_dir,
            workers: WorkerConfig::test(),
            ..Default::default()
        }
    }

    /// Parse a TOML document
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file, then apply environment overrides
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml(&text)?;
        config.apply_env();
        config.verify_invariants();
        Ok(config)
    }

    /// Apply `TSDB_*` environment overrides, clamping to explicit limits
    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("TSDB_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }

        if let Some(n) = std::env::var("TSDB_COMPACTION_THREADS")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        {
            self.workers.compaction_threads = n;
        }

        if let Some(n) = std::env::var("TSDB_REPLICATION_THREADS")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        {
            self.workers.replication_threads = n;
        }

        self.clamp();
    }

    fn clamp(&mut self) {
        self.workers.compaction_threads = self.workers.compaction_threads.min(WORKER_THREADS_MAX);
        self.workers.replication_threads =
            self.workers.replication_threads.min(WORKER_THREADS_MAX);
        let pass_ms = (self.workers.pass_interval.as_millis() as u64)
            .clamp(PASS_INTERVAL_MS_MIN, PASS_INTERVAL_MS_MAX);
        self.workers.pass_interval = Duration::from_millis(pass_ms);
    }

    /// Reject configurations that cannot be served
    pub fn validate(&self) -> Result<(), ConfigError> {
        for ns in &self.namespaces {
            if !crate::key::is_valid_namespace(&ns.name) {
                return Err(ConfigError::Invalid(format!(
                    "namespace {:?} contains '~' or starts with 0x1B",
                    ns.name
                )));
            }
            for stream in &ns.streams {
                if stream.replication_factor == 0 {
                    return Err(ConfigError::Invalid(format!(
                        "stream prefix {:?} in namespace {:?} has replication_factor 0",
                        stream.stream_key_prefix, ns.name
                    )));
                }
            }
        }
        if self.index.map_size_bytes == 0 {
            return Err(ConfigError::Invalid("index.map_size_bytes is 0".to_string()));
        }
        Ok(())
    }

    /// TigerStyle: Verify all struct invariants hold
    #[inline]
    fn verify_invariants(&self) {
        debug_assert!(
            self.workers.compaction_threads <= WORKER_THREADS_MAX,
            "Invariant: compaction_threads {} exceeds max {}",
            self.workers.compaction_threads,
            WORKER_THREADS_MAX
        );
        debug_assert!(
            self.workers.replication_threads <= WORKER_THREADS_MAX,
            "Invariant: replication_threads {} exceeds max {}",
            self.workers.replication_threads,
            WORKER_THREADS_MAX
        );
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
