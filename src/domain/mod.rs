//! Domain layer containing entities, errors, and port definitions.

/// Entity definitions.
pub mod entities;
/// Error types.
pub mod errors;
/// Port definitions.
pub mod ports;

pub use entities::{Origin, RequestKey, RequestKind, RequestOptions, RequestState, UriDescriptor};
pub use errors::{CancelCause, FailCause};
pub use ports::{ImageCodec, RequestListener, SourceFetcher};
