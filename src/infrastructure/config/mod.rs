//! Engine configuration.

pub mod args;
pub mod engine_config;
pub mod storage;

pub use args::CliArgs;
pub use engine_config::{
    AssetsConfig, DiskCacheConfig, EngineConfig, LogLevel, MemoryCacheConfig, NetworkConfig,
    PoolConfig, SchedulerConfig,
};
pub use storage::{ConfigError, StorageManager};
