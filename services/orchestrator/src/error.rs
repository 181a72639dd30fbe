//! Error types for the orchestration core.

use std::time::Duration;

use emesh_id::{EngineType, IdError, InstanceId};
use thiserror::Error;

use crate::actors::ActorError;
use crate::engine::EngineError;

/// Errors surfaced by the runtime, registry, cluster and supervisor layers.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Engine `init` failed; the runtime never started.
    #[error("engine {engine_type} failed to initialize: {reason}")]
    InitFailed {
        engine_type: EngineType,
        reason: String,
    },

    /// A deadline elapsed (real-time processing, introspection, stop).
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },

    /// No registered engine satisfies the selection criteria.
    #[error("no engine available with capabilities {capabilities:?}")]
    NoEngineAvailable { capabilities: Vec<String> },

    /// A selection strategy name could not be parsed.
    #[error("unknown selection strategy: {0}")]
    UnknownStrategy(String),

    /// The addressed engine, instance or engine type does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Instance id omitted while several instances of the type run.
    #[error("{count} instances of {engine_type} are running; specify an instance id")]
    MultipleMatches {
        engine_type: EngineType,
        count: usize,
    },

    /// The engine process is no longer alive.
    #[error("engine instance {instance_id} is not alive")]
    EngineDead { instance_id: InstanceId },

    /// A health check could not be completed.
    #[error("health check failed: {0}")]
    HealthCheckFailed(String),

    /// Restart requested for an instance whose start config is unknown.
    #[error("no recorded config for {engine_type} instance {instance_id}")]
    MissingConfig {
        engine_type: EngineType,
        instance_id: InstanceId,
    },

    /// The cluster could not place a child.
    #[error("placement failed: {0}")]
    Placement(String),

    /// The engine returned an error while processing.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Actor plumbing failure.
    #[error(transparent)]
    Actor(#[from] ActorError),

    /// An identifier failed validation.
    #[error(transparent)]
    Id(#[from] IdError),
}

impl OrchestratorError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        OrchestratorError::NotFound(what.to_string())
    }

    /// Returns true if the error means the addressed engine is gone.
    pub fn is_dead(&self) -> bool {
        matches!(
            self,
            OrchestratorError::EngineDead { .. } | OrchestratorError::Actor(ActorError::ActorStopped)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, OrchestratorError::Timeout { .. })
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
