//! Domain entity definitions.

mod options;
mod request_key;
mod request_state;
mod resource;
mod uri;

pub use options::{DecodeQuality, RequestLevel, RequestOptions, Resize, ScaleMode, Size};
pub use request_key::RequestKey;
pub use request_state::{Origin, RequestKind, RequestState};
pub use resource::{
    BufferRecycler, DecodedPayload, DisplayRef, ManagedResource, PixelFormat, PooledBuffer,
    RecycledError, ResourceHandle, SizeClass,
};
pub use uri::{INLINE_PREFIX, UriDescriptor, UriScheme};
