//! Infrastructure layer with caches, fetchers and configuration.

/// Engine configuration.
pub mod config;
/// Source fetchers.
pub mod fetch;
/// Caches, buffer pool and codec.
pub mod image;

pub use config::{CliArgs, EngineConfig, LogLevel, StorageManager};
pub use fetch::{CompositeFetcher, HttpFetcher, InlineFetcher, LocalFetcher};
pub use image::{DiskCache, ImageCrateCodec, MemoryCache, ResourcePool};
