//! In-memory LRU cache of decoded resources.

use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::domain::entities::{ManagedResource, RequestKey, ResourceHandle};

/// Default memory cache budget (64 MB).
pub const DEFAULT_MEMORY_CACHE_BYTES: usize = 64 * 1024 * 1024;

struct CacheState {
    entries: LruCache<RequestKey, ManagedResource>,
    total_bytes: usize,
}

impl CacheState {
    fn detach(&mut self, key: &RequestKey) -> Option<ManagedResource> {
        let resource = self.entries.pop(key)?;
        self.total_bytes -= resource.byte_size();
        resource.release();
        Some(resource)
    }

    /// Evicts least recently used entries without display references until
    /// `budget` is met. Displayed entries are skipped in place, keeping their
    /// LRU position for the next pass.
    fn trim_to(&mut self, budget: usize) -> usize {
        if self.total_bytes <= budget {
            return 0;
        }

        let mut projected = self.total_bytes;
        let mut victims = Vec::new();
        for (key, resource) in self.entries.iter().rev() {
            if projected <= budget {
                break;
            }
            if resource.display_ref_count() > 0 {
                trace!(key = %key, "Skipping displayed entry during eviction");
                continue;
            }
            projected -= resource.byte_size();
            victims.push(key.clone());
        }

        for key in &victims {
            if self.detach(key).is_some() {
                debug!(key = %key, "Evicted from memory cache");
            }
        }
        if self.total_bytes > budget {
            warn!(
                resident = self.total_bytes,
                budget, "Memory cache over budget, remaining entries are displayed"
            );
        }
        victims.len()
    }
}

/// Statistics about cache performance.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Hit rate as a percentage.
    pub hit_rate: f64,
    /// Current number of cached resources.
    pub size: usize,
    /// Resident bytes.
    pub bytes: usize,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cache: {} images ({} bytes), {:.1}% hit rate ({} hits, {} misses)",
            self.size, self.bytes, self.hit_rate, self.hits, self.misses
        )
    }
}

/// In-memory LRU cache for decoded resources, bounded by resident bytes.
///
/// Every mutation and every lookup that hands out a handle runs under one
/// lock, so a handle can never be created for an entry that eviction is
/// concurrently detaching.
pub struct MemoryCache {
    state: Mutex<CacheState>,
    max_bytes: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryCache {
    /// Creates a cache holding at most `max_bytes` of evictable resources.
    #[must_use]
    pub fn new(max_bytes: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                total_bytes: 0,
            }),
            max_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Looks up `key`, promoting it and registering a pending use.
    pub fn get(&self, key: &RequestKey) -> Option<ResourceHandle> {
        let mut state = self.state.lock();
        if let Some(resource) = state.entries.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Memory cache hit");
            Some(resource.acquire())
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Memory cache miss");
            None
        }
    }

    /// Peeks at a resource without promoting it in the LRU.
    pub fn peek(&self, key: &RequestKey) -> Option<ResourceHandle> {
        let state = self.state.lock();
        state.entries.peek(key).map(ManagedResource::acquire)
    }

    /// Returns true if `key` is resident.
    pub fn contains(&self, key: &RequestKey) -> bool {
        self.state.lock().entries.contains(key)
    }

    /// Stores `resource` under `key`, then evicts down to the budget.
    ///
    /// A previous entry under the same key is detached and recycled once
    /// nobody holds it anymore.
    pub fn put(&self, key: RequestKey, resource: ManagedResource) {
        let mut state = self.state.lock();
        debug!(key = %key, bytes = resource.byte_size(), "Storing resource in memory cache");

        resource.adopt();
        let bytes = resource.byte_size();
        match state.entries.push(key, resource.clone()) {
            Some((_, previous)) if previous.ptr_eq(&resource) => {}
            Some((_, previous)) => {
                state.total_bytes = state.total_bytes + bytes - previous.byte_size();
                previous.release();
            }
            None => state.total_bytes += bytes,
        }

        state.trim_to(self.max_bytes);
    }

    /// Removes `key`.
    pub fn remove(&self, key: &RequestKey) -> bool {
        let removed = self.state.lock().detach(key).is_some();
        if removed {
            debug!(key = %key, "Removed from memory cache");
        }
        removed
    }

    /// Evicts every entry that is not displayed.
    pub fn trim_all(&self) -> usize {
        let evicted = self.state.lock().trim_to(0);
        debug!(evicted, "Trimmed memory cache");
        evicted
    }

    /// Clears all entries that are not displayed. Alias of [`Self::trim_all`].
    pub fn clear(&self) {
        self.trim_all();
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns true if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resident bytes.
    pub fn resident_bytes(&self) -> usize {
        self.state.lock().total_bytes
    }

    /// Configured budget.
    #[must_use]
    pub const fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Returns cache statistics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        let state = self.state.lock();
        CacheStats {
            hits,
            misses,
            hit_rate,
            size: state.entries.len(),
            bytes: state.total_bytes,
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_CACHE_BYTES)
    }
}
