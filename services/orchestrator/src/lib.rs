//! enginemesh orchestration core
//!
//! Discovers, supervises, selects and throttles pluggable processing
//! engines across a cluster of nodes.
//!
//! ## Architecture
//!
//! ```text
//! EngineSupervisor ──► ClusterSupervisor (LocalCluster)
//!        │                    │ places and restarts
//!        ▼                    ▼
//! EngineRegistry ◄──── EngineRuntime(instance)
//!   selection                 └── ProcessingState (mode machine)
//! ```
//!
//! ## Modules
//!
//! - `actors`: Actor framework used by engine runtimes
//! - `mode`: Processing-mode state machine
//! - `runtime`: Per-instance engine runtime actor and its handle
//! - `registry`: Engine directory, load scores and selection strategies
//! - `cluster`: Cluster supervision primitive and membership
//! - `supervisor`: Engine lifecycle across the cluster

pub mod actors;
pub mod catalog;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod mode;
pub mod registry;
pub mod runtime;
pub mod supervisor;
pub mod telemetry;

// Re-export commonly used types
pub use catalog::{EngineCatalog, EngineFactory};
pub use cluster::{ClusterSupervisor, LocalCluster, RestartStrategy, StaticMembership};
pub use config::Config;
pub use engine::{Capabilities, Engine, EngineConfig, EngineError, Health, MockEngine};
pub use error::{OrchestratorError, OrchestratorResult};
pub use mode::{Mode, ProcessingState};
pub use registry::{EngineRegistry, SelectionCriteria, SelectionStrategy};
pub use runtime::{RuntimeHandle, RuntimeStats};
pub use supervisor::{ClusterHealth, EngineSupervisor, StartOptions};
pub use telemetry::{MemorySink, TelemetrySink, TracingSink};
