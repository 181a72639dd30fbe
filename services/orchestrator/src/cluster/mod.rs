//! Cluster supervision primitive.
//!
//! The supervisor never places or restarts processes itself. It hands a
//! [`ChildSpec`] and the live member list to a [`ClusterSupervisor`], which
//! starts the child somewhere, restarts it per its [`RestartStrategy`] and
//! reports its status.
//!
//! [`LocalCluster`] implements the primitive in-process over a set of
//! simulated members.

mod local;
mod membership;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use emesh_events::ExitReason;
use emesh_id::{EngineType, InstanceId, NodeId};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

pub use local::LocalCluster;
pub use membership::{Membership, StaticMembership};

use crate::engine::EngineConfig;
use crate::error::OrchestratorResult;
use crate::runtime::RuntimeHandle;

/// When an exited child is started again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartStrategy {
    /// Always restarted.
    #[default]
    Permanent,
    /// Restarted only after an abnormal exit.
    Transient,
    /// Never restarted.
    Temporary,
}

impl RestartStrategy {
    pub fn should_restart(&self, reason: ExitReason) -> bool {
        match self {
            RestartStrategy::Permanent => true,
            RestartStrategy::Transient => reason.is_abnormal(),
            RestartStrategy::Temporary => false,
        }
    }
}

/// Everything needed to start (and restart) one engine instance.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    pub engine_type: EngineType,
    pub instance_id: InstanceId,
    pub config: EngineConfig,
    pub restart: RestartStrategy,
    /// Grace period for a stop before the child is killed.
    pub shutdown_timeout: Duration,
    pub metadata: BTreeMap<String, String>,
}

/// Result of a start request. Starting a running child is not an error.
#[derive(Debug, Clone)]
pub enum StartOutcome {
    Started(RuntimeHandle),
    AlreadyStarted(RuntimeHandle),
}

impl StartOutcome {
    pub fn handle(&self) -> &RuntimeHandle {
        match self {
            StartOutcome::Started(h) | StartOutcome::AlreadyStarted(h) => h,
        }
    }

    pub fn into_handle(self) -> RuntimeHandle {
        match self {
            StartOutcome::Started(h) | StartOutcome::AlreadyStarted(h) => h,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, StartOutcome::Started(_))
    }
}

/// Supervision status of a child, observable through [`ClusterSupervisor::monitor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Running { restarts: u32 },
    /// Waiting out the backoff before restart attempt `attempt`.
    Restarting { attempt: u32 },
    /// Final: the child will not be started again.
    Exited(ExitReason),
}

/// Starts, stops and watches engine processes across the cluster.
#[async_trait]
pub trait ClusterSupervisor: Send + Sync {
    /// Starts `spec` on one of `members`.
    async fn start_child(&self, spec: ChildSpec, members: &[NodeId]) -> OrchestratorResult<StartOutcome>;

    /// Stops a child, killing it if it has not exited within `timeout`.
    /// The child is not restarted afterwards.
    async fn stop_child(&self, instance_id: &InstanceId, timeout: Duration) -> OrchestratorResult<()>;

    /// Status updates for a supervised child.
    fn monitor(&self, instance_id: &InstanceId) -> Option<watch::Receiver<ChildStatus>>;

    /// Current handle of a child; changes across restarts.
    fn handle(&self, instance_id: &InstanceId) -> Option<RuntimeHandle>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(RestartStrategy::Permanent, ExitReason::Normal, true)]
    #[case(RestartStrategy::Permanent, ExitReason::Crashed, true)]
    #[case(RestartStrategy::Transient, ExitReason::Normal, false)]
    #[case(RestartStrategy::Transient, ExitReason::Shutdown, false)]
    #[case(RestartStrategy::Transient, ExitReason::Killed, true)]
    #[case(RestartStrategy::Transient, ExitReason::Crashed, true)]
    #[case(RestartStrategy::Temporary, ExitReason::Crashed, false)]
    fn test_should_restart(
        #[case] strategy: RestartStrategy,
        #[case] reason: ExitReason,
        #[case] expected: bool,
    ) {
        assert_eq!(strategy.should_restart(reason), expected);
    }
}
