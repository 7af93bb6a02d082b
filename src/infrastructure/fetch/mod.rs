//! Source fetchers, one per family of identifier schemes.

mod http;
mod inline;
mod local;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

pub use http::{DEFAULT_TIMEOUT_SECS, HttpFetcher};
pub use inline::InlineFetcher;
pub use local::LocalFetcher;

use crate::domain::entities::{UriDescriptor, UriScheme};
use crate::domain::errors::FetchError;
use crate::domain::ports::{FetchObserver, SourceFetcher};

/// Routes each identifier to the first fetcher that supports its scheme.
#[derive(Clone, Default)]
pub struct CompositeFetcher {
    fetchers: Vec<Arc<dyn SourceFetcher>>,
}

impl CompositeFetcher {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a fetcher. Earlier fetchers win on overlapping schemes.
    #[must_use]
    pub fn with(mut self, fetcher: Arc<dyn SourceFetcher>) -> Self {
        self.fetchers.push(fetcher);
        self
    }

    fn route(&self, scheme: UriScheme) -> Option<&Arc<dyn SourceFetcher>> {
        self.fetchers.iter().find(|f| f.supports(scheme))
    }
}

impl std::fmt::Debug for CompositeFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeFetcher")
            .field("fetchers", &self.fetchers.len())
            .finish()
    }
}

#[async_trait]
impl SourceFetcher for CompositeFetcher {
    fn supports(&self, scheme: UriScheme) -> bool {
        self.route(scheme).is_some()
    }

    async fn fetch(
        &self,
        uri: &UriDescriptor,
        observer: &dyn FetchObserver,
    ) -> Result<Bytes, FetchError> {
        let fetcher = self
            .route(uri.scheme())
            .ok_or_else(|| FetchError::UnsupportedScheme {
                scheme: uri.scheme().to_string(),
            })?;
        fetcher.fetch(uri, observer).await
    }
}
