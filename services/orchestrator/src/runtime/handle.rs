//! Messages accepted by an engine runtime and the handle used to send them.

use std::time::Duration;

use emesh_events::ExitReason;
use emesh_id::{EngineType, InstanceId, NodeId};
use serde_json::Value;
use tokio::sync::oneshot;

use super::stats::RuntimeStats;
use crate::actors::{ActorError, ActorHandle, WeakActorHandle};
use crate::engine::{Capabilities, Health};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::mode::{Mode, ModeSnapshot, Priority};

/// Per-call options for processing requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessOptions {
    pub priority: Priority,
    /// Overrides the runtime's real-time deadline.
    pub timeout: Option<Duration>,
}

impl ProcessOptions {
    pub fn urgent() -> Self {
        Self {
            priority: Priority::Urgent,
            timeout: None,
        }
    }

    pub fn with_priority(priority: Priority) -> Self {
        Self {
            priority,
            timeout: None,
        }
    }
}

/// Result of a successful real-time call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutput {
    pub result: Value,
    pub processing_time: Duration,
    pub mode: Mode,
}

/// Result of a successful batch call.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutput {
    pub results: Vec<Value>,
    pub processing_time: Duration,
    pub mode: Mode,
}

/// Capabilities, health and statistics read in one round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSnapshot {
    pub capabilities: Capabilities,
    pub health: Health,
    pub statistics: RuntimeStats,
}

/// Messages for an engine runtime.
#[derive(Debug)]
pub enum RuntimeMessage {
    ProcessRealTime {
        data: Value,
        options: ProcessOptions,
        reply: oneshot::Sender<OrchestratorResult<ProcessOutput>>,
    },
    ProcessBatch {
        items: Vec<Value>,
        options: ProcessOptions,
        reply: oneshot::Sender<OrchestratorResult<BatchOutput>>,
    },
    Capabilities {
        reply: oneshot::Sender<Capabilities>,
    },
    HealthStatus {
        reply: oneshot::Sender<Health>,
    },
    Statistics {
        reply: oneshot::Sender<RuntimeStats>,
    },
    Describe {
        reply: oneshot::Sender<EngineSnapshot>,
    },
    /// Forwarded to the engine; errors are logged only.
    HandleEvent {
        event: Value,
    },
    /// CPU and memory usage as fractions of capacity.
    ReportLoad {
        cpu: f64,
        memory: f64,
    },
    ForceMode {
        mode: Mode,
        reason: String,
        reply: oneshot::Sender<Mode>,
    },
    ModeSnapshot {
        reply: oneshot::Sender<ModeSnapshot>,
    },
    /// Run a health check now and reply with the result.
    CheckHealth {
        reply: oneshot::Sender<Health>,
    },
    /// Periodic health check trigger.
    HealthTick,
    Stop {
        reason: ExitReason,
    },
}

/// Location-transparent reference to a running engine runtime.
///
/// Cheap to clone. All calls fail with `EngineDead` once the runtime exits.
#[derive(Debug, Clone)]
pub struct RuntimeHandle {
    engine_type: EngineType,
    instance_id: InstanceId,
    node: NodeId,
    actor: ActorHandle<RuntimeMessage>,
}

impl RuntimeHandle {
    pub(crate) fn new(
        engine_type: EngineType,
        instance_id: InstanceId,
        node: NodeId,
        actor: ActorHandle<RuntimeMessage>,
    ) -> Self {
        Self {
            engine_type,
            instance_id,
            node,
            actor,
        }
    }

    pub fn engine_type(&self) -> &EngineType {
        &self.engine_type
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Identifies this particular process; a restart gets a new one.
    pub fn process_id(&self) -> &str {
        self.actor.actor_id()
    }

    pub fn is_alive(&self) -> bool {
        !self.actor.is_closed()
    }

    /// Completes once the runtime process has exited.
    pub async fn closed(&self) {
        self.actor.closed().await
    }

    pub fn same_process(&self, other: &RuntimeHandle) -> bool {
        self.process_id() == other.process_id()
    }

    pub(crate) fn downgrade(&self) -> WeakActorHandle<RuntimeMessage> {
        self.actor.downgrade()
    }

    // =========================================================================
    // Processing
    // =========================================================================

    pub async fn process_real_time(&self, data: Value) -> OrchestratorResult<ProcessOutput> {
        self.process_real_time_with(data, ProcessOptions::default())
            .await
    }

    pub async fn process_real_time_with(
        &self,
        data: Value,
        options: ProcessOptions,
    ) -> OrchestratorResult<ProcessOutput> {
        self.call(|reply| RuntimeMessage::ProcessRealTime {
            data,
            options,
            reply,
        })
        .await?
    }

    pub async fn process_batch(&self, items: Vec<Value>) -> OrchestratorResult<BatchOutput> {
        self.process_batch_with(items, ProcessOptions::default()).await
    }

    pub async fn process_batch_with(
        &self,
        items: Vec<Value>,
        options: ProcessOptions,
    ) -> OrchestratorResult<BatchOutput> {
        self.call(|reply| RuntimeMessage::ProcessBatch {
            items,
            options,
            reply,
        })
        .await?
    }

    pub async fn handle_event(&self, event: Value) -> OrchestratorResult<()> {
        self.cast(RuntimeMessage::HandleEvent { event }).await
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub async fn capabilities(&self) -> OrchestratorResult<Capabilities> {
        self.call(|reply| RuntimeMessage::Capabilities { reply })
            .await
    }

    pub async fn health_status(&self) -> OrchestratorResult<Health> {
        self.call(|reply| RuntimeMessage::HealthStatus { reply })
            .await
    }

    pub async fn statistics(&self) -> OrchestratorResult<RuntimeStats> {
        self.call(|reply| RuntimeMessage::Statistics { reply }).await
    }

    pub async fn describe(&self) -> OrchestratorResult<EngineSnapshot> {
        self.call(|reply| RuntimeMessage::Describe { reply }).await
    }

    /// `describe` bounded by a timeout.
    pub async fn describe_within(&self, timeout: Duration) -> OrchestratorResult<EngineSnapshot> {
        match tokio::time::timeout(timeout, self.describe()).await {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::Timeout {
                operation: "introspection",
                elapsed: timeout,
            }),
        }
    }

    pub async fn check_health(&self) -> OrchestratorResult<Health> {
        self.call(|reply| RuntimeMessage::CheckHealth { reply })
            .await
    }

    // =========================================================================
    // Administration
    // =========================================================================

    pub async fn report_load(&self, cpu: f64, memory: f64) -> OrchestratorResult<()> {
        self.cast(RuntimeMessage::ReportLoad { cpu, memory }).await
    }

    pub async fn force_mode(&self, mode: Mode, reason: impl Into<String>) -> OrchestratorResult<Mode> {
        let reason = reason.into();
        self.call(|reply| RuntimeMessage::ForceMode { mode, reason, reply })
            .await
    }

    pub async fn mode_snapshot(&self) -> OrchestratorResult<ModeSnapshot> {
        self.call(|reply| RuntimeMessage::ModeSnapshot { reply })
            .await
    }

    /// Asks the runtime to stop after its current message.
    pub async fn stop(&self, reason: ExitReason) -> OrchestratorResult<()> {
        self.cast(RuntimeMessage::Stop { reason }).await
    }

    // =========================================================================
    // Plumbing
    // =========================================================================

    async fn cast(&self, msg: RuntimeMessage) -> OrchestratorResult<()> {
        self.actor.send(msg).await.map_err(|e| self.map_send_error(e))
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RuntimeMessage,
    ) -> OrchestratorResult<T> {
        let (tx, rx) = oneshot::channel();
        self.cast(make(tx)).await?;
        // The reply sender is dropped unanswered only if the runtime died.
        rx.await.map_err(|_| self.dead())
    }

    fn map_send_error(&self, error: ActorError) -> OrchestratorError {
        match error {
            ActorError::ActorStopped => self.dead(),
            other => OrchestratorError::Actor(other),
        }
    }

    fn dead(&self) -> OrchestratorError {
        OrchestratorError::EngineDead {
            instance_id: self.instance_id.clone(),
        }
    }
}
