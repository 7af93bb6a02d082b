//! Codec and transform errors.

use thiserror::Error;

/// Errors raised by the codec or a transform.
#[derive(Debug, Clone, Error)]
#[allow(missing_docs)]
pub enum CodecError {
    #[error("unrecognized image format")]
    UnknownFormat,

    #[error("malformed image data: {message}")]
    Malformed { message: String },

    #[error("transform failed: {message}")]
    Transform { message: String },

    #[error("out of memory allocating {bytes} bytes")]
    OutOfMemory { bytes: usize },
}

impl CodecError {
    /// Creates a malformed data error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    /// Creates a transform error.
    #[must_use]
    pub fn transform(message: impl Into<String>) -> Self {
        Self::Transform {
            message: message.into(),
        }
    }

    /// Returns whether the failure was an allocation failure.
    #[must_use]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}
