//! Terminal causes reported to listeners.

use thiserror::Error;

/// Why a request failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[allow(missing_docs)]
pub enum FailCause {
    #[error("identifier is empty or malformed")]
    InvalidIdentifier,

    #[error("unsupported identifier scheme: {identifier}")]
    UnsupportedScheme { identifier: String },

    #[error("fetch failed: {message}")]
    FetchFailed { message: String },

    #[error("decode failed: {message}")]
    DecodeFailed { message: String },

    #[error("resource was recycled before delivery")]
    ResourceRecycled,

    #[error("out of memory while decoding")]
    OutOfMemory,
}

impl FailCause {
    /// Creates a fetch failure.
    #[must_use]
    pub fn fetch(message: impl Into<String>) -> Self {
        Self::FetchFailed {
            message: message.into(),
        }
    }

    /// Creates a decode failure.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::DecodeFailed {
            message: message.into(),
        }
    }
}

/// Why a request was canceled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CancelCause {
    /// Explicit caller cancellation, or engine shutdown.
    #[error("canceled")]
    Normal,
    /// A newer request took over the same display target.
    #[error("superseded by a newer request")]
    Superseded,
    /// The request level forbade the stage that was needed.
    #[error("request level forbids the required stage")]
    LevelRestricted,
    /// The consuming target went away.
    #[error("consumer was torn down")]
    ConsumerTornDown,
    /// The stage queue overflowed and dropped the request before it ran.
    #[error("discarded by a full stage queue")]
    Discarded,
}
