//! Network fetcher backed by reqwest.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::domain::entities::{UriDescriptor, UriScheme};
use crate::domain::errors::FetchError;
use crate::domain::ports::{FetchObserver, SourceFetcher};

/// Default request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

// Preallocation cap for bodies announcing a Content-Length.
const MAX_PREALLOC: u64 = 8 * 1024 * 1024;

/// Fetches `http://` and `https://` identifiers.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Creates a fetcher with its own connection pool.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created.
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| FetchError::network(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    fn supports(&self, scheme: UriScheme) -> bool {
        scheme.is_network()
    }

    async fn fetch(
        &self,
        uri: &UriDescriptor,
        observer: &dyn FetchObserver,
    ) -> Result<Bytes, FetchError> {
        if !self.supports(uri.scheme()) {
            return Err(FetchError::UnsupportedScheme {
                scheme: uri.scheme().to_string(),
            });
        }

        debug!(url = %uri, "Downloading from network");
        let mut response = self
            .client
            .get(uri.content())
            .send()
            .await
            .map_err(|e| FetchError::network(format!("Request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(FetchError::HttpStatus {
                status: response.status().as_u16(),
            });
        }

        let total = response.content_length().unwrap_or(0);
        #[allow(clippy::cast_possible_truncation)]
        let mut body = BytesMut::with_capacity(total.min(MAX_PREALLOC) as usize);

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| FetchError::network(format!("Failed to read body: {e}")))?
        {
            if observer.is_canceled() {
                trace!(url = %uri, "Download canceled mid-body");
                return Err(FetchError::Canceled);
            }
            body.extend_from_slice(&chunk);
            observer.on_progress(total, body.len() as u64);
        }

        debug!(url = %uri, size = body.len(), "Download complete");
        Ok(body.freeze())
    }
}
