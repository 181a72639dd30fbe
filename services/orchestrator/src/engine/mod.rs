//! The pluggable engine contract.
//!
//! An engine is the domain worker a runtime wraps. The runtime owns the
//! engine's state value and threads it through every call; the engine itself
//! is shared immutably so a real-time call can run on a detached task.

mod mock;

use std::collections::BTreeSet;

use async_trait::async_trait;
use emesh_events::ExitReason;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use mock::{MockControls, MockEngine, MockState};

/// Opaque capability tags an engine advertises.
pub type Capabilities = BTreeSet<String>;

/// Engine start configuration, passed verbatim to `init`.
pub type EngineConfig = serde_json::Value;

/// Builds a capability set from string literals.
pub fn capabilities<I, S>(tags: I) -> Capabilities
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    tags.into_iter().map(Into::into).collect()
}

/// Health of an engine instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Degraded,
    Unhealthy,
    #[default]
    Unknown,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Healthy => "healthy",
            Health::Degraded => "degraded",
            Health::Unhealthy => "unhealthy",
            Health::Unknown => "unknown",
        }
    }

    /// Healthy and degraded engines may serve traffic.
    pub fn is_serving(&self) -> bool {
        matches!(self, Health::Healthy | Health::Degraded)
    }
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors an engine reports from its own calls.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The engine rejected or failed the work.
    #[error("engine failed: {0}")]
    Failed(String),

    /// The engine call panicked; its state was not advanced.
    #[error("engine panicked: {0}")]
    Panicked(String),

    /// The engine does not implement this operation.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

/// A pluggable engine implementation.
///
/// `process_*` calls hand back the state on both success and failure so an
/// engine may evolve even when it rejects work.
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    /// Engine-internal state threaded through every call.
    type State: Clone + Send + Sync + 'static;

    /// Capabilities this engine provides.
    fn capabilities(&self) -> Capabilities;

    async fn init(&self, config: &EngineConfig) -> Result<Self::State, EngineError>;

    async fn process_real_time(
        &self,
        data: serde_json::Value,
        state: Self::State,
    ) -> (Result<serde_json::Value, EngineError>, Self::State);

    async fn process_batch(
        &self,
        items: Vec<serde_json::Value>,
        state: Self::State,
    ) -> (Result<Vec<serde_json::Value>, EngineError>, Self::State) {
        (Err(EngineError::Unsupported("process_batch")), state)
    }

    async fn health_check(&self, _state: &Self::State) -> Health {
        Health::Healthy
    }

    /// Handles an out-of-band event. On error the state is left as the
    /// engine left it.
    async fn handle_event(
        &self,
        _event: serde_json::Value,
        _state: &mut Self::State,
    ) -> Result<(), EngineError> {
        Ok(())
    }

    async fn terminate(&self, _reason: ExitReason, _state: Self::State) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_serving() {
        assert!(Health::Healthy.is_serving());
        assert!(Health::Degraded.is_serving());
        assert!(!Health::Unhealthy.is_serving());
        assert!(!Health::Unknown.is_serving());
    }

    #[test]
    fn test_health_serialization() {
        assert_eq!(serde_json::to_string(&Health::Degraded).unwrap(), "\"degraded\"");
        assert_eq!(Health::default(), Health::Unknown);
    }

    #[test]
    fn test_capabilities_helper() {
        let caps = capabilities(["b", "a", "a"]);
        assert_eq!(caps.len(), 2);
        assert_eq!(caps.iter().next().map(String::as_str), Some("a"));
    }
}
