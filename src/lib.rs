//! Pixload - an asynchronous image loading engine.
//!
//! Requests resolve through a decoded memory cache, a raw byte disk cache
//! and the original source, in that order. Identical requests in flight
//! share one fetch and one decode, and decoded buffers are pooled for reuse.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Application layer containing the engine, scheduler and request lifecycle.
pub mod application;
/// Domain layer containing entities, errors, and port definitions.
pub mod domain;
/// Infrastructure layer containing caches, fetchers, codec and configuration.
pub mod infrastructure;

pub use application::{DisplayTarget, Engine, EngineBuilder, LoadOutcome, RequestHandle};

/// Current version of the library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = "pixload";
