//! Source fetch errors.

use thiserror::Error;

/// Errors raised while acquiring raw bytes.
#[derive(Debug, Clone, Error)]
#[allow(missing_docs)]
pub enum FetchError {
    #[error("network error: {message}")]
    Network { message: String },

    #[error("http status {status}")]
    HttpStatus { status: u16 },

    #[error("local source not found: {path}")]
    NotFound { path: String },

    #[error("io error: {message}")]
    Io { message: String },

    #[error("invalid inline payload: {reason}")]
    InvalidInline { reason: String },

    #[error("scheme not handled by this fetcher: {scheme}")]
    UnsupportedScheme { scheme: String },

    #[error("fetch canceled")]
    Canceled,
}

impl FetchError {
    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates an I/O error.
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Creates an inline payload error.
    #[must_use]
    pub fn invalid_inline(reason: impl Into<String>) -> Self {
        Self::InvalidInline {
            reason: reason.into(),
        }
    }

    /// Returns whether retrying later might succeed.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Io { .. } => true,
            Self::HttpStatus { status } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}
