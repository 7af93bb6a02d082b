//! Size-classed pool of reusable decode buffers.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::domain::entities::{BufferRecycler, PooledBuffer, SizeClass};
use crate::domain::ports::BufferSource;

/// Default pool budget (32 MB).
pub const DEFAULT_POOL_BYTES: usize = 32 * 1024 * 1024;

/// Default number of idle buffers kept per size class.
pub const DEFAULT_BUCKET_CAPACITY: usize = 8;

struct Slot {
    seq: u64,
    buffer: PooledBuffer,
}

#[derive(Default)]
struct PoolState {
    buckets: HashMap<SizeClass, VecDeque<Slot>>,
    // Release sequence -> bucket, oldest first.
    order: BTreeMap<u64, SizeClass>,
    total_bytes: usize,
    next_seq: u64,
}

impl PoolState {
    fn take(&mut self, class: SizeClass) -> Option<PooledBuffer> {
        let bucket = self.buckets.get_mut(&class)?;
        let slot = bucket.pop_back()?;
        if bucket.is_empty() {
            self.buckets.remove(&class);
        }
        self.order.remove(&slot.seq);
        self.total_bytes -= slot.buffer.capacity();
        Some(slot.buffer)
    }

    /// Smallest idle buffer of the same format that can hold `class`.
    fn nearest_fit(&self, class: SizeClass) -> Option<SizeClass> {
        let needed = class.byte_len();
        self.buckets
            .iter()
            .filter(|(candidate, slots)| {
                candidate.format == class.format
                    && slots.back().is_some_and(|s| s.buffer.capacity() >= needed)
            })
            .min_by_key(|(_, slots)| slots.back().map_or(usize::MAX, |s| s.buffer.capacity()))
            .map(|(candidate, _)| *candidate)
    }

    fn evict_oldest(&mut self) -> Option<usize> {
        let (&seq, &class) = self.order.iter().next()?;
        self.order.remove(&seq);
        let bucket = self.buckets.get_mut(&class)?;
        let slot = bucket.pop_front()?;
        debug_assert_eq!(slot.seq, seq);
        if bucket.is_empty() {
            self.buckets.remove(&class);
        }
        let freed = slot.buffer.capacity();
        self.total_bytes -= freed;
        Some(freed)
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Acquisitions served from the pool.
    pub hits: u64,
    /// Acquisitions that found nothing suitable.
    pub misses: u64,
    /// Idle buffers held.
    pub idle_buffers: usize,
    /// Bytes held by idle buffers.
    pub idle_bytes: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool: {} idle buffers ({} bytes), {} hits, {} misses",
            self.idle_buffers, self.idle_bytes, self.hits, self.misses
        )
    }
}

/// A pool of decode-target buffers, bucketed by size class, with a global
/// byte budget enforced by dropping the least recently released buffers.
pub struct ResourcePool {
    state: Mutex<PoolState>,
    max_bytes: usize,
    bucket_capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResourcePool {
    /// Creates a pool holding at most `max_bytes` of idle buffers and at most
    /// `bucket_capacity` buffers per size class.
    #[must_use]
    pub fn new(max_bytes: usize, bucket_capacity: usize) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            max_bytes,
            bucket_capacity: bucket_capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Takes an idle buffer for `class`.
    ///
    /// An exact match is preferred; otherwise the smallest buffer of the same
    /// format that is large enough is reshaped to `class`.
    pub fn acquire(&self, class: SizeClass) -> Option<PooledBuffer> {
        let mut state = self.state.lock();

        let found = state.take(class).or_else(|| {
            let fit = state.nearest_fit(class)?;
            state.take(fit).map(|buffer| buffer.reshape(class))
        });

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(size = %class.size, format = %class.format, "Pool hit");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            trace!(size = %class.size, format = %class.format, "Pool miss");
        }
        found
    }

    /// Returns a buffer to the pool.
    ///
    /// The caller gives up ownership, so a buffer still referenced by a
    /// resource cannot be released.
    pub fn release(&self, buffer: PooledBuffer) {
        let bytes = buffer.capacity();
        if bytes == 0 || bytes > self.max_bytes {
            return;
        }

        let class = buffer.class();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let seq = state.next_seq;
        state.next_seq += 1;
        state.total_bytes += bytes;
        state.order.insert(seq, class);
        let bucket = state.buckets.entry(class).or_default();
        bucket.push_back(Slot { seq, buffer });

        if bucket.len() > self.bucket_capacity
            && let Some(oldest) = bucket.pop_front()
        {
            state.order.remove(&oldest.seq);
            state.total_bytes -= oldest.buffer.capacity();
        }

        let mut freed = 0;
        while state.total_bytes > self.max_bytes {
            match state.evict_oldest() {
                Some(n) => freed += n,
                None => break,
            }
        }
        if freed > 0 {
            debug!(freed, total = state.total_bytes, "Pool over budget, dropped buffers");
        }
    }

    /// Drops every idle buffer.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let bytes = state.total_bytes;
        *state = PoolState::default();
        debug!(bytes, "Cleared resource pool");
    }

    /// Returns pool statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            idle_buffers: state.order.len(),
            idle_bytes: state.total_bytes,
        }
    }
}

impl Default for ResourcePool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_BYTES, DEFAULT_BUCKET_CAPACITY)
    }
}

impl BufferSource for ResourcePool {
    fn obtain(&self, class: SizeClass) -> PooledBuffer {
        self.acquire(class)
            .unwrap_or_else(|| PooledBuffer::allocate(class))
    }

    fn give_back(&self, buffer: PooledBuffer) {
        self.release(buffer);
    }
}

impl BufferRecycler for ResourcePool {
    fn recycle(&self, buffer: PooledBuffer) {
        self.release(buffer);
    }
}
