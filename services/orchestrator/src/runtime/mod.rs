//! Engine runtime: the per-instance actor wrapping an engine.
//!
//! A runtime owns its engine state and a [`ProcessingState`](crate::mode::ProcessingState).
//! It enforces the real-time deadline, keeps per-mode statistics, runs
//! periodic health checks and pushes its status to the registry.

mod actor;
mod handle;
mod stats;

use std::collections::BTreeMap;
use std::sync::Arc;

use emesh_id::{EngineType, InstanceId, NodeId};

pub use actor::EngineRuntime;
pub use handle::{
    BatchOutput, EngineSnapshot, ProcessOptions, ProcessOutput, RuntimeHandle, RuntimeMessage,
};
pub use stats::{ModeStats, RuntimeStats};

use crate::actors::{self, ActorExit, ActorRef};
use crate::config::RuntimeConfig;
use crate::engine::{Engine, EngineConfig};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::registry::EngineRegistry;
use crate::telemetry::TelemetrySink;

/// Everything a runtime needs besides the engine itself.
#[derive(Clone)]
pub struct RuntimeContext {
    pub engine_type: EngineType,
    pub instance_id: InstanceId,
    pub node: NodeId,
    pub config: EngineConfig,
    pub metadata: BTreeMap<String, String>,
    pub settings: RuntimeConfig,
    pub registry: Arc<EngineRegistry>,
    pub telemetry: Arc<dyn TelemetrySink>,
}

/// A started runtime: its handle plus the supervision endpoints.
#[derive(Debug)]
pub struct LaunchedRuntime {
    pub handle: RuntimeHandle,
    pub actor: ActorRef,
    pub exit: ActorExit,
}

/// Starts a runtime for `engine`. Returns once `init` has succeeded and the
/// runtime has announced itself to the registry.
pub async fn spawn_runtime<E: Engine>(
    engine: E,
    ctx: RuntimeContext,
) -> OrchestratorResult<LaunchedRuntime> {
    let (actor_handle, mailbox) = actors::mailbox(ctx.engine_type.as_str(), ctx.settings.mailbox_size);
    let handle = RuntimeHandle::new(
        ctx.engine_type.clone(),
        ctx.instance_id.clone(),
        ctx.node,
        actor_handle,
    );
    let engine_type = ctx.engine_type.clone();
    let runtime = EngineRuntime::new(engine, ctx, handle.clone());

    let (actor, exit) = actors::start(runtime, mailbox)
        .await
        .map_err(|e| OrchestratorError::InitFailed {
            engine_type,
            reason: e.to_string(),
        })?;

    Ok(LaunchedRuntime {
        handle,
        actor,
        exit,
    })
}
