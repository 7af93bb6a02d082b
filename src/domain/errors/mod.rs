//! Domain error types.

mod cache_error;
mod codec_error;
mod fetch_error;
mod request_error;

pub use cache_error::{CacheError, CacheResult};
pub use codec_error::CodecError;
pub use fetch_error::FetchError;
pub use request_error::{CancelCause, FailCause};
