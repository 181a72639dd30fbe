//! # emesh-events
//!
//! Telemetry event definitions for the enginemesh orchestration core.
//!
//! ## Design Principles
//!
//! - Events are fire-and-forget records of lifecycle facts (an engine started,
//!   was registered, went down, switched mode)
//! - Every event carries a process-wide monotonic `event_id` so a sink can
//!   order events emitted from concurrent actors
//! - Numeric facts go in `measurements`, descriptive facts in `metadata`
//!
//! ## Event Kinds
//!
//! - Engine lifecycle (`engine.started`, `engine.stopped`, `engine.restarted`)
//! - Registry membership (`engine.registered`, `engine.deregistered`, `engine.down`)
//! - Runtime state (`engine.health_changed`, `engine.mode_changed`, `engine.alert`)
//! - Registry maintenance (`registry.cleanup`)

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
