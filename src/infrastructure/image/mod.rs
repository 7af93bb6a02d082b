//! Image storage infrastructure.
//!
//! This module provides:
//! - Memory caching of decoded resources with LRU eviction
//! - Disk caching of raw bytes for persistence
//! - A size-classed pool of reusable decode buffers
//! - The default `image`-crate codec

pub mod codec;
pub mod disk_cache;
mod disk_journal;
pub mod memory_cache;
pub mod resource_pool;

pub use codec::{DEFAULT_MAX_DECODE_ALLOC, ImageCrateCodec};
pub use disk_cache::{DEFAULT_MAX_CACHE_SIZE, DiskCache, DiskEntry, dirs_cache_path};
pub use memory_cache::{CacheStats, DEFAULT_MEMORY_CACHE_BYTES, MemoryCache};
pub use resource_pool::{DEFAULT_BUCKET_CAPACITY, DEFAULT_POOL_BYTES, PoolStats, ResourcePool};
