//! Port definitions for the codec and post-decode transforms.
//!
//! Both are black boxes to the engine; it only manages the buffers they
//! consume through [`BufferSource`].

use crate::domain::entities::{DecodedPayload, PooledBuffer, RequestOptions, SizeClass};
use crate::domain::errors::CodecError;

/// Hands out decode-target buffers.
pub trait BufferSource: Send + Sync {
    /// Returns a buffer for `class`, reused when possible.
    fn obtain(&self, class: SizeClass) -> PooledBuffer;

    /// Returns an intermediate buffer the caller no longer references.
    fn give_back(&self, buffer: PooledBuffer);
}

/// Turns raw bytes into a decoded payload.
#[cfg_attr(test, mockall::automock)]
pub trait ImageCodec: Send + Sync {
    /// Decodes `bytes`, honoring size and quality options.
    ///
    /// # Errors
    /// Returns [`CodecError`] for unreadable data or allocation failure.
    fn decode(
        &self,
        bytes: &[u8],
        options: &RequestOptions,
        buffers: &dyn BufferSource,
    ) -> Result<DecodedPayload, CodecError>;
}

/// A post-decode pixel transform (rounding, blur, masking...).
#[cfg_attr(test, mockall::automock)]
pub trait ImageTransform: Send + Sync {
    /// Stable identity; part of the request key.
    fn identity(&self) -> String;

    /// Transforms `payload`. The input buffer should be given back through
    /// `buffers` when a new one is produced.
    ///
    /// # Errors
    /// Returns [`CodecError`] if the transform cannot be applied.
    fn apply(
        &self,
        payload: DecodedPayload,
        options: &RequestOptions,
        buffers: &dyn BufferSource,
    ) -> Result<DecodedPayload, CodecError>;
}
