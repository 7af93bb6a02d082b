//! Request coalescing.
//!
//! The first request for a key registers as the provider and does the work.
//! Requests for the same key arriving while the provider is in flight attach
//! as riders and do nothing until the provider hands them its outcome.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::domain::entities::RequestKey;

use super::request::RequestId;

/// Role assigned by [`FreeRideCoordinator::join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Do the work and resolve riders afterwards.
    Provider,
    /// Wait for the provider.
    Rider,
}

struct Group<R> {
    provider: RequestId,
    riders: Vec<(RequestId, R)>,
}

/// Coalescing statistics.
#[derive(Debug, Clone, Default)]
pub struct FreeRideStats {
    /// Groups with a provider in flight.
    pub active_providers: usize,
    /// Riders currently waiting.
    pub waiting_riders: usize,
    /// Riders attached since creation.
    pub total_riders: u64,
}

impl std::fmt::Display for FreeRideStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Free ride: {} providers, {} waiting riders, {} coalesced",
            self.active_providers, self.waiting_riders, self.total_riders
        )
    }
}

/// Registry of provider groups keyed by request key.
///
/// `R` is whatever the caller needs to resolve a rider later.
pub struct FreeRideCoordinator<R> {
    groups: Mutex<HashMap<RequestKey, Group<R>>>,
    total_riders: AtomicU64,
}

impl<R> FreeRideCoordinator<R> {
    /// Creates an empty coordinator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            total_riders: AtomicU64::new(0),
        }
    }

    /// Registers `id` as the provider for `key`, or attaches it as a rider if
    /// a provider is already in flight.
    pub fn join(&self, key: &RequestKey, id: RequestId, rider: R) -> Role {
        let mut groups = self.groups.lock();
        if let Some(group) = groups.get_mut(key) {
            group.riders.push((id, rider));
            self.total_riders.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, id, provider = group.provider, "Attached as rider");
            Role::Rider
        } else {
            groups.insert(
                key.clone(),
                Group {
                    provider: id,
                    riders: Vec::new(),
                },
            );
            trace!(key = %key, id, "Registered as provider");
            Role::Provider
        }
    }

    /// Detaches a rider that gave up. Returns false if it was not attached.
    pub fn leave(&self, key: &RequestKey, id: RequestId) -> bool {
        let mut groups = self.groups.lock();
        let Some(group) = groups.get_mut(key) else {
            return false;
        };
        let before = group.riders.len();
        group.riders.retain(|(rider, _)| *rider != id);
        let left = group.riders.len() != before;
        if left {
            trace!(key = %key, id, "Rider detached");
        }
        left
    }

    /// Unregisters the provider and returns its riders in attach order.
    ///
    /// Returns nothing if `id` is not the registered provider.
    pub fn finish(&self, key: &RequestKey, id: RequestId) -> Vec<R> {
        let mut groups = self.groups.lock();
        match groups.get(key) {
            Some(group) if group.provider == id => {}
            _ => return Vec::new(),
        }
        let riders: Vec<R> = groups
            .remove(key)
            .map(|group| group.riders.into_iter().map(|(_, r)| r).collect())
            .unwrap_or_default();
        if !riders.is_empty() {
            debug!(key = %key, id, riders = riders.len(), "Provider resolving riders");
        }
        riders
    }

    /// Returns the provider registered for `key`.
    #[must_use]
    pub fn provider_of(&self, key: &RequestKey) -> Option<RequestId> {
        self.groups.lock().get(key).map(|group| group.provider)
    }

    /// Returns coalescing statistics.
    #[must_use]
    pub fn stats(&self) -> FreeRideStats {
        let groups = self.groups.lock();
        FreeRideStats {
            active_providers: groups.len(),
            waiting_riders: groups.values().map(|g| g.riders.len()).sum(),
            total_riders: self.total_riders.load(Ordering::Relaxed),
        }
    }
}

impl<R> Default for FreeRideCoordinator<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> RequestKey {
        RequestKey::from("17:https://x/img.png_max(200x200)")
    }

    #[test]
    fn test_first_provides_rest_ride() {
        let coordinator = FreeRideCoordinator::new();
        assert_eq!(coordinator.join(&key(), 1, "a"), Role::Provider);
        assert_eq!(coordinator.join(&key(), 2, "b"), Role::Rider);
        assert_eq!(coordinator.join(&key(), 3, "c"), Role::Rider);
        assert_eq!(coordinator.provider_of(&key()), Some(1));

        let stats = coordinator.stats();
        assert_eq!(stats.active_providers, 1);
        assert_eq!(stats.waiting_riders, 2);
    }

    #[test]
    fn test_finish_returns_riders_in_attach_order() {
        let coordinator = FreeRideCoordinator::new();
        coordinator.join(&key(), 1, "provider");
        coordinator.join(&key(), 2, "first");
        coordinator.join(&key(), 3, "second");

        assert_eq!(coordinator.finish(&key(), 1), vec!["first", "second"]);
        assert!(coordinator.provider_of(&key()).is_none());
        assert_eq!(coordinator.stats().total_riders, 2);
    }

    #[test]
    fn test_only_provider_can_finish() {
        let coordinator = FreeRideCoordinator::new();
        coordinator.join(&key(), 1, ());
        coordinator.join(&key(), 2, ());

        assert!(coordinator.finish(&key(), 2).is_empty());
        assert_eq!(coordinator.provider_of(&key()), Some(1));
    }

    #[test]
    fn test_rider_leaves() {
        let coordinator = FreeRideCoordinator::new();
        coordinator.join(&key(), 1, 'p');
        coordinator.join(&key(), 2, 'a');
        coordinator.join(&key(), 3, 'b');

        assert!(coordinator.leave(&key(), 2));
        assert!(!coordinator.leave(&key(), 2));
        assert_eq!(coordinator.finish(&key(), 1), vec!['b']);
    }

    #[test]
    fn test_next_join_after_finish_provides_again() {
        let coordinator = FreeRideCoordinator::new();
        coordinator.join(&key(), 1, ());
        coordinator.finish(&key(), 1);
        assert_eq!(coordinator.join(&key(), 2, ()), Role::Provider);
    }
}
