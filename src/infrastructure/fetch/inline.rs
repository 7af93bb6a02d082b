//! Fetcher for `data:image/...;base64,` payloads.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;

use crate::domain::entities::{UriDescriptor, UriScheme};
use crate::domain::errors::FetchError;
use crate::domain::ports::{FetchObserver, SourceFetcher};

/// Decodes inline payloads. Never touches disk or network.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineFetcher;

impl InlineFetcher {
    fn decode(encoded: &str) -> Result<Vec<u8>, FetchError> {
        let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        general_purpose::STANDARD
            .decode(&compact)
            .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(&compact))
            .map_err(|e| FetchError::invalid_inline(e.to_string()))
    }
}

#[async_trait]
impl SourceFetcher for InlineFetcher {
    fn supports(&self, scheme: UriScheme) -> bool {
        scheme == UriScheme::Inline
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
        let bytes = Self::decode(uri.content())?;
        if bytes.is_empty() {
            return Err(FetchError::invalid_inline("empty payload"));
        }
        let len = bytes.len() as u64;
        observer.on_progress(len, len);
        Ok(Bytes::from(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::NoopObserver;

    async fn fetch(identifier: &str) -> Result<Bytes, FetchError> {
        let uri = UriDescriptor::parse(identifier).unwrap();
        InlineFetcher.fetch(&uri, &NoopObserver).await
    }

    #[tokio::test]
    async fn test_decodes_payload() {
        let encoded = general_purpose::STANDARD.encode(b"\x89PNG fake");
        let bytes = fetch(&format!("data:image/png;base64,{encoded}"))
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"\x89PNG fake");
    }

    #[tokio::test]
    async fn test_accepts_missing_padding() {
        let bytes = fetch("data:image/png;base64,YWJjZA").await.unwrap();
        assert_eq!(&bytes[..], b"abcd");
    }

    #[tokio::test]
    async fn test_rejects_garbage() {
        let err = fetch("data:image/png;base64,@@@@").await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidInline { .. }));
    }
}
