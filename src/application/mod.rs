//! Application layer: the engine, its scheduler and request lifecycle.

/// Engine value and builder.
pub mod engine;
/// Request coalescing.
pub mod free_ride;
/// Per-key async locks.
pub mod locks;
mod pipeline;
/// Request state and handles.
pub mod request;
/// Stage queues and the delivery channel.
pub mod scheduler;
/// Display targets.
pub mod target;

pub use engine::{Engine, EngineBuilder, EngineError, EngineStats};
pub use free_ride::{FreeRideCoordinator, FreeRideStats, Role};
pub use locks::{KeyedGuard, KeyedLockRegistry};
pub use request::{LoadOutcome, RequestHandle, RequestId};
pub use scheduler::{DeliveryQueue, RequestScheduler, SchedulerStats, Stage, StageLimits, StageTask};
pub use target::DisplayTarget;
