//! The flowforge orchestration engine.
//!
//! Drives DAGs whose nodes are agent tasks executed in sandboxed
//! containers or human gates (review / structured input). Execution is
//! durable and crash-safe: ground truth lives in the store, work is
//! claimed atomically, and the engine can be stopped and restarted
//! without losing or duplicating work.
//!
//! The pieces:
//!
//! - [`EventBus`]: in-process publish/subscribe fanning live progress
//!   out to streaming consumers
//! - [`FlowExecutor`]: the worker loop, DAG advancement, human-action
//!   handlers, rejection rollback, and cancellation

pub mod artifacts;
pub mod bus;
pub mod error;
pub mod executor;

pub use bus::{Event, EventBus, EventKind, Subscription, WILDCARD_CHANNEL};
pub use error::EngineError;
pub use executor::FlowExecutor;
