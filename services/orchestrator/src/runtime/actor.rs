//! The engine runtime actor.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use emesh_events::{EventKind, ExitReason, TelemetryEvent};
use emesh_id::{EngineType, InstanceId, NodeId};
use serde_json::Value;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::handle::{
    BatchOutput, EngineSnapshot, ProcessOptions, ProcessOutput, RuntimeHandle, RuntimeMessage,
};
use super::stats::RuntimeStats;
use super::RuntimeContext;
use crate::actors::{Actor, ActorContext, ActorError, WeakActorHandle};
use crate::config::RuntimeConfig;
use crate::engine::{Capabilities, Engine, EngineConfig, EngineError, Health};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::mode::{ModeAction, Outcome, ProcessingState, RequestInfo};
use crate::registry::EngineRegistry;
use crate::telemetry::TelemetrySink;

/// Actor wrapping one engine instance.
pub struct EngineRuntime<E: Engine> {
    engine: Arc<E>,
    engine_type: EngineType,
    instance_id: InstanceId,
    node: NodeId,
    config: EngineConfig,
    metadata: BTreeMap<String, String>,
    settings: RuntimeConfig,
    handle: RuntimeHandle,
    registry: Arc<EngineRegistry>,
    telemetry: Arc<dyn TelemetrySink>,

    /// Engine state; `None` until `init` succeeds and after `terminate`.
    state: Option<E::State>,
    capabilities: Capabilities,
    health: Health,
    processing: ProcessingState,
    stats: RuntimeStats,
    ticker: Option<AbortHandle>,
    exit_reason: ExitReason,
}

impl<E: Engine> EngineRuntime<E> {
    pub(crate) fn new(engine: E, ctx: RuntimeContext, handle: RuntimeHandle) -> Self {
        let processing = ProcessingState::new(ctx.settings.mode.clone(), Instant::now());
        let stats = RuntimeStats::new(ctx.settings.base_concurrency.max(1));
        Self {
            engine: Arc::new(engine),
            engine_type: ctx.engine_type,
            instance_id: ctx.instance_id,
            node: ctx.node,
            config: ctx.config,
            metadata: ctx.metadata,
            settings: ctx.settings,
            handle,
            registry: ctx.registry,
            telemetry: ctx.telemetry,
            state: None,
            capabilities: Capabilities::new(),
            health: Health::Unknown,
            processing,
            stats,
            ticker: None,
            exit_reason: ExitReason::Normal,
        }
    }

    fn event(&self, kind: EventKind) -> emesh_events::TelemetryEventBuilder {
        TelemetryEvent::builder(kind)
            .node(self.node)
            .engine(&self.engine_type, &self.instance_id)
    }

    fn dead(&self) -> OrchestratorError {
        OrchestratorError::EngineDead {
            instance_id: self.instance_id.clone(),
        }
    }

    // =========================================================================
    // Processing
    // =========================================================================

    async fn process_real_time(
        &mut self,
        data: Value,
        options: ProcessOptions,
    ) -> OrchestratorResult<ProcessOutput> {
        let now = Instant::now();
        let deadline = options.timeout.unwrap_or(self.settings.realtime_timeout);
        let request = RequestInfo::real_time(options.priority)
            .with_deadline(now + deadline)
            .with_data_size(payload_size(&data));
        let actions = self.processing.handle_request(request, now);
        self.apply_actions(actions);

        let state = self.state.clone().ok_or_else(|| self.dead())?;
        let engine = Arc::clone(&self.engine);
        let started = Instant::now();

        // Detached so a missed deadline abandons the call without touching our state.
        let call = tokio::spawn(async move { engine.process_real_time(data, state).await });

        match tokio::time::timeout(deadline, call).await {
            Ok(Ok((result, next_state))) => {
                let elapsed = started.elapsed();
                self.state = Some(next_state);
                match result {
                    Ok(value) => {
                        self.stats.real_time.record_success(elapsed);
                        self.processing
                            .update_metrics(&Outcome::success(elapsed), Instant::now());
                        debug!(
                            instance_id = %self.instance_id,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "Real-time request processed"
                        );
                        Ok(ProcessOutput {
                            result: value,
                            processing_time: elapsed,
                            mode: self.processing.mode(),
                        })
                    }
                    Err(e) => {
                        self.record_real_time_failure(elapsed);
                        warn!(instance_id = %self.instance_id, error = %e, "Real-time request failed");
                        Err(e.into())
                    }
                }
            }
            Ok(Err(join_error)) => {
                self.record_real_time_failure(started.elapsed());
                error!(instance_id = %self.instance_id, error = %join_error, "Engine call panicked");
                Err(EngineError::Panicked(join_error.to_string()).into())
            }
            Err(_) => {
                self.stats.real_time.record_timeout();
                self.processing
                    .update_metrics(&Outcome::failure(deadline), Instant::now());
                warn!(
                    instance_id = %self.instance_id,
                    deadline_ms = deadline.as_millis() as u64,
                    "Real-time request timed out"
                );
                Err(OrchestratorError::Timeout {
                    operation: "process_real_time",
                    elapsed: deadline,
                })
            }
        }
    }

    fn record_real_time_failure(&mut self, elapsed: Duration) {
        self.stats.real_time.record_failure();
        self.processing
            .update_metrics(&Outcome::failure(elapsed), Instant::now());
    }

    async fn process_batch(
        &mut self,
        items: Vec<Value>,
        options: ProcessOptions,
    ) -> OrchestratorResult<BatchOutput> {
        let now = Instant::now();
        let size = items.iter().map(payload_size).sum();
        let request = RequestInfo::batch(options.priority)
            .with_data_size(size)
            .with_complexity(items.len() as f64);
        let actions = self.processing.handle_request(request, now);
        self.apply_actions(actions);

        let state = self.state.clone().ok_or_else(|| self.dead())?;
        let engine = Arc::clone(&self.engine);
        let count = items.len() as u64;
        let started = Instant::now();

        // Spawned only to contain panics; no deadline applies to batches.
        let outcome = tokio::spawn(async move { engine.process_batch(items, state).await }).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok((Ok(results), next_state)) => {
                self.state = Some(next_state);
                self.stats.batch.record_success(elapsed);
                self.stats.batch_items += count;
                self.processing
                    .update_metrics(&Outcome::success(elapsed), Instant::now());
                debug!(instance_id = %self.instance_id, items = count, "Batch processed");
                Ok(BatchOutput {
                    results,
                    processing_time: elapsed,
                    mode: self.processing.mode(),
                })
            }
            Ok((Err(e), next_state)) => {
                self.state = Some(next_state);
                self.stats.batch.record_failure();
                self.processing
                    .update_metrics(&Outcome::failure(elapsed), Instant::now());
                warn!(instance_id = %self.instance_id, error = %e, "Batch failed");
                Err(e.into())
            }
            Err(join_error) => {
                self.stats.batch.record_failure();
                self.processing
                    .update_metrics(&Outcome::failure(elapsed), Instant::now());
                error!(instance_id = %self.instance_id, error = %join_error, "Engine batch call panicked");
                Err(EngineError::Panicked(join_error.to_string()).into())
            }
        }
    }

    async fn handle_event(&mut self, event: Value) {
        let Some(mut state) = self.state.clone() else {
            return;
        };
        let engine = Arc::clone(&self.engine);

        // A panicking handler leaves the previous state in place.
        let outcome = tokio::spawn(async move {
            let result = engine.handle_event(event, &mut state).await;
            (result, state)
        })
        .await;

        match outcome {
            Ok((Ok(()), next_state)) => {
                self.state = Some(next_state);
                self.stats.events_handled += 1;
            }
            Ok((Err(e), next_state)) => {
                self.state = Some(next_state);
                self.stats.event_errors += 1;
                warn!(instance_id = %self.instance_id, error = %e, "Engine rejected event");
            }
            Err(join_error) => {
                self.stats.event_errors += 1;
                error!(instance_id = %self.instance_id, error = %join_error, "Engine event handler panicked");
            }
        }
    }

    // =========================================================================
    // Health
    // =========================================================================

    async fn run_health_check(&mut self) -> Health {
        let Some(state) = self.state.clone() else {
            return self.health;
        };
        let engine = Arc::clone(&self.engine);

        let timeout = self.settings.health_check_timeout;
        let mut check = tokio::spawn(async move { engine.health_check(&state).await });
        let health = match tokio::time::timeout(timeout, &mut check).await {
            Ok(Ok(health)) => health,
            Ok(Err(join_error)) => {
                error!(instance_id = %self.instance_id, error = %join_error, "Engine health check panicked");
                Health::Unhealthy
            }
            Err(_) => {
                check.abort();
                let e = OrchestratorError::HealthCheckFailed(format!(
                    "no answer within {}ms",
                    timeout.as_millis()
                ));
                warn!(instance_id = %self.instance_id, error = %e, "Treating engine as unhealthy");
                Health::Unhealthy
            }
        };

        if health != self.health {
            let previous = self.health;
            self.health = health;
            if health == Health::Healthy {
                info!(instance_id = %self.instance_id, from = %previous, to = %health, "Engine health changed");
            } else {
                warn!(instance_id = %self.instance_id, from = %previous, to = %health, "Engine health changed");
            }
            self.telemetry.emit(
                self.event(EventKind::EngineHealthChanged)
                    .meta("from", previous.as_str())
                    .meta("to", health.as_str())
                    .build(),
            );
            let actions = self.processing.update_health(health, Instant::now());
            self.apply_actions(actions);
        }

        self.report_status();
        health
    }

    fn report_status(&self) {
        if let Err(e) = self.registry.update_status(
            &self.engine_type,
            &self.instance_id,
            self.health,
            self.stats.clone(),
        ) {
            debug!(instance_id = %self.instance_id, error = %e, "Status report skipped");
        }
    }

    // =========================================================================
    // Actions
    // =========================================================================

    fn apply_actions(&mut self, actions: Vec<ModeAction>) {
        for action in actions {
            match action {
                ModeAction::SwitchMode { mode } => {
                    let from = self.stats.mode;
                    self.stats.mode = mode;
                    info!(instance_id = %self.instance_id, from = %from, to = %mode, "Processing mode changed");
                    self.telemetry.emit(
                        self.event(EventKind::EngineModeChanged)
                            .meta("from", from.as_str())
                            .meta("to", mode.as_str())
                            .measure(
                                "transition_count",
                                self.processing.transition_count() as f64,
                            )
                            .build(),
                    );
                }
                ModeAction::ShedLoad { percent } => {
                    let dropped = self.processing.shed_load(percent);
                    warn!(instance_id = %self.instance_id, percent, dropped, "Shedding queued load");
                }
                ModeAction::IncreaseConcurrency { percent } => self.adjust_concurrency(true, percent),
                ModeAction::DecreaseConcurrency { percent } => self.adjust_concurrency(false, percent),
                ModeAction::Alert { mode, message } => {
                    warn!(instance_id = %self.instance_id, mode = %mode, message = %message, "Engine alert");
                    self.telemetry.emit(
                        self.event(EventKind::EngineAlert)
                            .meta("mode", mode.as_str())
                            .meta("message", message)
                            .build(),
                    );
                }
            }
        }
    }

    fn adjust_concurrency(&mut self, increase: bool, percent: u8) {
        let current = self.stats.concurrency_limit.max(1);
        let step = ((u64::from(current) * u64::from(percent)) / 100).max(1) as u32;
        let next = if increase {
            current
                .saturating_add(step)
                .min(self.settings.max_concurrency.max(1))
        } else {
            current.saturating_sub(step).max(1)
        };
        self.stats.concurrency_limit = next;
        debug!(instance_id = %self.instance_id, from = current, to = next, "Concurrency limit adjusted");
    }
}

#[async_trait]
impl<E: Engine> Actor for EngineRuntime<E> {
    type Message = RuntimeMessage;

    fn name(&self) -> &str {
        "engine_runtime"
    }

    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        let engine = Arc::clone(&self.engine);
        let config = self.config.clone();
        let state = match tokio::spawn(async move { engine.init(&config).await }).await {
            Ok(Ok(state)) => state,
            Ok(Err(e)) => {
                error!(
                    engine_type = %self.engine_type,
                    instance_id = %self.instance_id,
                    error = %e,
                    "Engine init failed"
                );
                return Err(ActorError::Permanent(e.to_string()));
            }
            Err(join_error) => {
                error!(
                    engine_type = %self.engine_type,
                    instance_id = %self.instance_id,
                    error = %join_error,
                    "Engine init panicked"
                );
                return Err(ActorError::Permanent(format!("init panicked: {join_error}")));
            }
        };
        self.state = Some(state);
        self.capabilities = self.engine.capabilities();
        self.health = Health::Healthy;

        self.registry.announce(
            self.handle.clone(),
            self.capabilities.clone(),
            self.health,
            self.stats.clone(),
            self.metadata.clone(),
        );
        self.ticker = Some(spawn_health_ticker(
            self.handle.downgrade(),
            self.settings.health_check_interval,
        ));

        info!(
            engine_type = %self.engine_type,
            instance_id = %self.instance_id,
            node_id = %self.node,
            capabilities = ?self.capabilities,
            "Engine runtime started"
        );
        Ok(())
    }

    async fn handle(&mut self, msg: RuntimeMessage, _ctx: &mut ActorContext) -> Result<bool, ActorError> {
        match msg {
            RuntimeMessage::ProcessRealTime {
                data,
                options,
                reply,
            } => {
                let result = self.process_real_time(data, options).await;
                let _ = reply.send(result);
            }
            RuntimeMessage::ProcessBatch {
                items,
                options,
                reply,
            } => {
                let result = self.process_batch(items, options).await;
                let _ = reply.send(result);
            }
            RuntimeMessage::Capabilities { reply } => {
                let _ = reply.send(self.capabilities.clone());
            }
            RuntimeMessage::HealthStatus { reply } => {
                let _ = reply.send(self.health);
            }
            RuntimeMessage::Statistics { reply } => {
                let _ = reply.send(self.stats.clone());
            }
            RuntimeMessage::Describe { reply } => {
                let _ = reply.send(EngineSnapshot {
                    capabilities: self.capabilities.clone(),
                    health: self.health,
                    statistics: self.stats.clone(),
                });
            }
            RuntimeMessage::HandleEvent { event } => self.handle_event(event).await,
            RuntimeMessage::ReportLoad { cpu, memory } => {
                let actions = self
                    .processing
                    .update_resource_usage(cpu, memory, Instant::now());
                self.apply_actions(actions);
            }
            RuntimeMessage::ForceMode {
                mode,
                reason,
                reply,
            } => {
                info!(instance_id = %self.instance_id, mode = %mode, reason = %reason, "Forcing processing mode");
                let actions = self
                    .processing
                    .force_transition(mode, &reason, Instant::now());
                self.apply_actions(actions);
                let _ = reply.send(self.processing.mode());
            }
            RuntimeMessage::ModeSnapshot { reply } => {
                let _ = reply.send(self.processing.snapshot(Instant::now()));
            }
            RuntimeMessage::CheckHealth { reply } => {
                let health = self.run_health_check().await;
                let _ = reply.send(health);
            }
            RuntimeMessage::HealthTick => {
                self.run_health_check().await;
            }
            RuntimeMessage::Stop { reason } => {
                self.exit_reason = reason;
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext, reason: ExitReason) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        if let Some(state) = self.state.take() {
            let engine = Arc::clone(&self.engine);
            if let Err(join_error) = tokio::spawn(async move { engine.terminate(reason, state).await }).await {
                error!(instance_id = %self.instance_id, error = %join_error, "Engine terminate panicked");
            }
        }
        self.registry.unregister(&self.engine_type, &self.instance_id);
        info!(
            engine_type = %self.engine_type,
            instance_id = %self.instance_id,
            reason = %reason,
            "Engine runtime stopped"
        );
    }

    fn exit_reason(&self) -> ExitReason {
        self.exit_reason
    }
}

/// Sends `HealthTick` every `period` until the runtime is gone.
fn spawn_health_ticker(handle: WeakActorHandle<RuntimeMessage>, period: Duration) -> AbortHandle {
    let period = period.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(handle) = handle.upgrade() else {
                break;
            };
            match handle.try_send(RuntimeMessage::HealthTick) {
                // A full mailbox means a tick is already pending work.
                Ok(()) | Err(ActorError::MailboxFull) => {}
                Err(_) => break,
            }
        }
    })
    .abort_handle()
}

fn payload_size(value: &Value) -> usize {
    value.to_string().len()
}
