//! Per-key async locks with explicit lifecycle.
//!
//! Each key maps to one mutex plus a count of tasks holding or waiting on
//! it. The entry is dropped as soon as that count reaches zero, so the map
//! only ever holds keys with work in flight.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

struct Slot {
    lock: Arc<AsyncMutex<()>>,
    users: usize,
}

struct RegistryInner {
    name: &'static str,
    slots: Mutex<HashMap<String, Slot>>,
}

impl RegistryInner {
    fn release(&self, key: &str) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(key) {
            slot.users -= 1;
            if slot.users == 0 {
                slots.remove(key);
                trace!(registry = self.name, key, "Dropped idle lock entry");
            }
        }
    }
}

/// A registry of named async mutexes, one per key.
#[derive(Clone)]
pub struct KeyedLockRegistry {
    inner: Arc<RegistryInner>,
}

/// Counts a user of a slot; dropping it gives the count back, whether or not
/// the lock was ever acquired.
struct Registration {
    registry: Arc<RegistryInner>,
    key: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

/// Exclusive hold on one key. Released on drop.
pub struct KeyedGuard {
    // Field order matters: the mutex unlocks before the registration is
    // given back.
    _guard: OwnedMutexGuard<()>,
    registration: Registration,
}

impl KeyedGuard {
    /// The locked key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.registration.key
    }
}

impl std::fmt::Debug for KeyedGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedGuard")
            .field("registry", &self.registration.registry.name)
            .field("key", &self.registration.key)
            .finish()
    }
}

impl KeyedLockRegistry {
    /// Creates an empty registry. `name` only shows up in logs.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                name,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Waits for exclusive access to `key`.
    ///
    /// Dropping the returned future before it resolves leaves the registry
    /// consistent.
    pub async fn lock(&self, key: &str) -> KeyedGuard {
        let lock = {
            let mut slots = self.inner.slots.lock();
            let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
                lock: Arc::new(AsyncMutex::new(())),
                users: 0,
            });
            slot.users += 1;
            Arc::clone(&slot.lock)
        };
        let registration = Registration {
            registry: Arc::clone(&self.inner),
            key: key.to_string(),
        };

        trace!(registry = self.inner.name, key, "Waiting for lock");
        let guard = lock.lock_owned().await;
        trace!(registry = self.inner.name, key, "Lock acquired");

        KeyedGuard {
            _guard: guard,
            registration,
        }
    }

    /// Number of keys with a holder or waiter.
    #[must_use]
    pub fn active_keys(&self) -> usize {
        self.inner.slots.lock().len()
    }

    /// Holders plus waiters for `key`.
    #[must_use]
    pub fn users(&self, key: &str) -> usize {
        self.inner.slots.lock().get(key).map_or(0, |slot| slot.users)
    }
}

impl std::fmt::Debug for KeyedLockRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedLockRegistry")
            .field("name", &self.inner.name)
            .field("active_keys", &self.active_keys())
            .finish()
    }
}
