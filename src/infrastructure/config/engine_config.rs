//! Engine configuration.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::infrastructure::fetch::DEFAULT_TIMEOUT_SECS;
use crate::infrastructure::image::{
    DEFAULT_BUCKET_CAPACITY, DEFAULT_MAX_CACHE_SIZE, DEFAULT_MEMORY_CACHE_BYTES,
    DEFAULT_POOL_BYTES,
};

pub(super) const APP_NAME: &str = "pixload";
pub(super) const APP_QUALIFIER: &str = "com";
pub(super) const APP_ORGANIZATION: &str = "pixload";

const MIB: u64 = 1024 * 1024;

/// Log level configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level.
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    #[default]
    Info,
    /// Warning level.
    Warn,
    /// Error level.
    Error,
}

impl LogLevel {
    /// Converts to tracing level.
    #[must_use]
    pub const fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trace => write!(f, "trace"),
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Engine configuration, loaded from `config.toml` and overridden by CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Configuration file path.
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Log file path. Logs go nowhere when unset and no default exists.
    #[serde(default)]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Decoded resource cache.
    #[serde(default)]
    pub memory_cache: MemoryCacheConfig,

    /// Raw byte cache.
    #[serde(default)]
    pub disk_cache: DiskCacheConfig,

    /// Decode buffer pool.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Stage queues and worker counts.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// HTTP transport.
    #[serde(default)]
    pub network: NetworkConfig,

    /// Local source roots.
    #[serde(default)]
    pub assets: AssetsConfig,
}

/// Memory cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryCacheConfig {
    /// Budget for resident decoded bytes.
    #[serde(default = "default_memory_bytes")]
    pub max_bytes: usize,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_memory_bytes(),
        }
    }
}

/// Disk cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskCacheConfig {
    /// Persist downloaded bytes.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cache directory. Defaults to the platform cache dir.
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Budget for stored bytes.
    #[serde(default = "default_disk_bytes")]
    pub max_bytes: u64,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: None,
            max_bytes: default_disk_bytes(),
        }
    }
}

/// Resource pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Budget for idle buffers.
    #[serde(default = "default_pool_bytes")]
    pub max_bytes: usize,

    /// Idle buffers kept per size class.
    #[serde(default = "default_bucket_capacity")]
    pub bucket_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_pool_bytes(),
            bucket_capacity: default_bucket_capacity(),
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Pending tasks held by the dispatch stage.
    #[serde(default = "default_queue_capacity")]
    pub dispatch_queue: usize,

    /// Parallel network fetches.
    #[serde(default = "default_network_workers")]
    pub network_workers: usize,

    /// Pending tasks held by the network stage.
    #[serde(default = "default_queue_capacity")]
    pub network_queue: usize,

    /// Parallel decodes.
    #[serde(default = "default_decode_workers")]
    pub decode_workers: usize,

    /// Pending tasks held by the decode stage.
    #[serde(default = "default_queue_capacity")]
    pub decode_queue: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dispatch_queue: default_queue_capacity(),
            network_workers: default_network_workers(),
            network_queue: default_queue_capacity(),
            decode_workers: default_decode_workers(),
            decode_queue: default_queue_capacity(),
        }
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// User agent sent with every request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

/// Local source configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssetsConfig {
    /// Directory `asset://` identifiers resolve under.
    #[serde(default)]
    pub asset_root: Option<PathBuf>,

    /// Directory `content://` identifiers resolve under.
    #[serde(default)]
    pub content_root: Option<PathBuf>,

    /// TOML table mapping `drawable://` ids to paths.
    #[serde(default)]
    pub resource_table: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_memory_bytes() -> usize {
    DEFAULT_MEMORY_CACHE_BYTES
}

fn default_disk_bytes() -> u64 {
    DEFAULT_MAX_CACHE_SIZE
}

fn default_pool_bytes() -> usize {
    DEFAULT_POOL_BYTES
}

fn default_bucket_capacity() -> usize {
    DEFAULT_BUCKET_CAPACITY
}

fn default_queue_capacity() -> usize {
    128
}

fn default_network_workers() -> usize {
    5
}

fn default_decode_workers() -> usize {
    2
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_user_agent() -> String {
    format!("{APP_NAME}/{}", env!("CARGO_PKG_VERSION"))
}

use super::args::CliArgs;

impl EngineConfig {
    /// Merges CLI arguments into the configuration.
    #[allow(clippy::cast_possible_truncation)]
    pub fn merge_with_args(&mut self, args: &CliArgs) {
        if let Some(config_path) = &args.config {
            self.config = Some(config_path.clone());
        }
        if let Some(log_path) = &args.log_path {
            self.log_path = Some(log_path.clone());
        }
        if let Some(log_level) = args.log_level {
            self.log_level = log_level;
        }
        if let Some(mb) = args.memory_cache_mb {
            self.memory_cache.max_bytes = (mb * MIB) as usize;
        }
        if let Some(mb) = args.disk_cache_mb {
            self.disk_cache.max_bytes = mb * MIB;
        }
        if let Some(dir) = &args.cache_dir {
            self.disk_cache.directory = Some(dir.clone());
        }
        if args.no_disk_cache {
            self.disk_cache.enabled = false;
        }
        if let Some(workers) = args.network_workers {
            self.scheduler.network_workers = workers;
        }
        if let Some(workers) = args.decode_workers {
            self.scheduler.decode_workers = workers;
        }
        if let Some(root) = &args.asset_root {
            self.assets.asset_root = Some(root.clone());
        }
    }

    /// Returns default config directory.
    #[must_use]
    pub fn default_config_dir() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Returns default config file path.
    #[must_use]
    pub fn default_config_path() -> Option<PathBuf> {
        Self::default_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Returns default log file path.
    #[must_use]
    pub fn default_log_path() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.data_dir().join("pixload.log"))
    }

    /// Returns effective config path.
    #[must_use]
    pub fn effective_config_path(&self) -> Option<PathBuf> {
        self.config.clone().or_else(Self::default_config_path)
    }

    /// Returns effective log path.
    #[must_use]
    pub fn effective_log_path(&self) -> Option<PathBuf> {
        self.log_path.clone().or_else(Self::default_log_path)
    }

    /// Returns the effective disk cache directory.
    #[must_use]
    pub fn effective_cache_dir(&self) -> PathBuf {
        self.disk_cache
            .directory
            .clone()
            .unwrap_or_else(crate::infrastructure::image::dirs_cache_path)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            config: None,
            log_path: None,
            log_level: LogLevel::Info,
            memory_cache: MemoryCacheConfig::default(),
            disk_cache: DiskCacheConfig::default(),
            pool: PoolConfig::default(),
            scheduler: SchedulerConfig::default(),
            network: NetworkConfig::default(),
            assets: AssetsConfig::default(),
        }
    }
}
