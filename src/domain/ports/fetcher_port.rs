//! Port definition for raw byte acquisition.

use bytes::Bytes;

use crate::domain::entities::{UriDescriptor, UriScheme};
use crate::domain::errors::FetchError;

/// Observes a fetch in progress.
pub trait FetchObserver: Send + Sync {
    /// Reports progress. `total` is 0 when the length is unknown.
    fn on_progress(&self, total: u64, completed: u64);

    /// Returns true once the owning request was canceled. Fetchers check this
    /// between chunks and bail out with [`FetchError::Canceled`].
    fn is_canceled(&self) -> bool;
}

/// An observer that ignores progress and never cancels.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl FetchObserver for NoopObserver {
    fn on_progress(&self, _total: u64, _completed: u64) {}

    fn is_canceled(&self) -> bool {
        false
    }
}

/// Port for turning an identifier into raw bytes.
/// Implementations must be thread-safe.
#[async_trait::async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Returns true if this fetcher handles `scheme`.
    fn supports(&self, scheme: UriScheme) -> bool;

    /// Fetches every byte of `uri`.
    async fn fetch(
        &self,
        uri: &UriDescriptor,
        observer: &dyn FetchObserver,
    ) -> Result<Bytes, FetchError>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Fetcher serving fixed bytes per identifier and counting calls.
    pub struct MockFetcher {
        responses: HashMap<String, Bytes>,
        calls: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl MockFetcher {
        /// Creates an empty mock.
        pub fn new() -> Self {
            Self {
                responses: HashMap::new(),
                calls: Arc::new(AtomicUsize::new(0)),
                delay: Duration::ZERO,
            }
        }

        /// Serves `bytes` for `identifier`.
        pub fn with_response(mut self, identifier: &str, bytes: impl Into<Bytes>) -> Self {
            self.responses.insert(identifier.to_string(), bytes.into());
            self
        }

        /// Sleeps before answering.
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        /// Shared call counter.
        pub fn calls(&self) -> Arc<AtomicUsize> {
            Arc::clone(&self.calls)
        }
    }

    #[async_trait::async_trait]
    impl SourceFetcher for MockFetcher {
        fn supports(&self, _scheme: UriScheme) -> bool {
            true
        }

        async fn fetch(
            &self,
            uri: &UriDescriptor,
            observer: &dyn FetchObserver,
        ) -> Result<Bytes, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if observer.is_canceled() {
                return Err(FetchError::Canceled);
            }
            let bytes = self
                .responses
                .get(uri.as_str())
                .cloned()
                .ok_or_else(|| FetchError::HttpStatus { status: 404 })?;
            observer.on_progress(bytes.len() as u64, bytes.len() as u64);
            Ok(bytes)
        }
    }
}
