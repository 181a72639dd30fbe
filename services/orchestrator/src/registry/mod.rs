//! Engine registry: the cluster-wide directory of running engine instances.
//!
//! Writes (register, announce, update, removal) are serialized behind one
//! lock and publish a fresh map snapshot; readers clone the snapshot `Arc`
//! and never observe a partially built descriptor.
//!
//! Each registration installs a monitor task that waits for the process to
//! exit and removes its descriptor without waiting for the periodic sweep.

mod descriptor;
mod load;
mod selection;
mod sweeper;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use emesh_events::{EventKind, TelemetryEvent};
use emesh_id::{EngineType, InstanceId};
use serde::Serialize;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

pub use descriptor::{EngineDescriptor, EngineFilter, EngineInfo, RegistryKey};
pub use load::{load_score, mode_load, LoadWeights};
pub use selection::{FindOptions, SelectionCriteria, SelectionStrategy};
pub use sweeper::run_cleanup_loop;

use crate::config::RegistryConfig;
use crate::engine::{Capabilities, Health};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::runtime::{RuntimeHandle, RuntimeStats};
use crate::telemetry::TelemetrySink;

type Table = BTreeMap<RegistryKey, Arc<EngineDescriptor>>;

struct Monitor {
    process_id: String,
    task: AbortHandle,
}

/// Aggregate registry counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub by_engine_type: BTreeMap<String, usize>,
    pub by_node: BTreeMap<String, usize>,
    pub by_health: BTreeMap<String, usize>,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    /// Successful `get_best` selections per strategy.
    pub selections: BTreeMap<String, u64>,
}

/// The engine directory.
pub struct EngineRegistry {
    config: RegistryConfig,
    telemetry: Arc<dyn TelemetrySink>,
    table: RwLock<Arc<Table>>,
    monitors: Mutex<HashMap<RegistryKey, Monitor>>,
    round_robin: Mutex<HashMap<Vec<String>, u64>>,
    selections: [AtomicU64; 4],
    started_at: DateTime<Utc>,
    me: Weak<EngineRegistry>,
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("engines", &self.len())
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

impl EngineRegistry {
    pub fn new(config: RegistryConfig, telemetry: Arc<dyn TelemetrySink>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            config,
            telemetry,
            table: RwLock::new(Arc::new(Table::new())),
            monitors: Mutex::new(HashMap::new()),
            round_robin: Mutex::new(HashMap::new()),
            selections: Default::default(),
            started_at: Utc::now(),
            me: me.clone(),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Registers a running engine, introspecting it for capabilities, health
    /// and statistics.
    ///
    /// Introspection is bounded by the configured timeout. If the engine does
    /// not answer in time it is registered anyway with no capabilities and
    /// `Unknown` health.
    pub async fn register(
        &self,
        engine_type: EngineType,
        instance_id: InstanceId,
        process: RuntimeHandle,
        metadata: BTreeMap<String, String>,
    ) -> OrchestratorResult<Arc<EngineDescriptor>> {
        if !process.is_alive() {
            return Err(OrchestratorError::EngineDead { instance_id });
        }

        let (capabilities, health, statistics) =
            match process.describe_within(self.config.introspection_timeout).await {
                Ok(snapshot) => (snapshot.capabilities, snapshot.health, snapshot.statistics),
                Err(e) if e.is_dead() => return Err(OrchestratorError::EngineDead { instance_id }),
                Err(e) => {
                    let e = OrchestratorError::HealthCheckFailed(e.to_string());
                    warn!(
                        engine_type = %engine_type,
                        instance_id = %instance_id,
                        error = %e,
                        "Registering engine without introspection"
                    );
                    (Capabilities::new(), Health::Unknown, RuntimeStats::default())
                }
            };

        Ok(self.install(EngineDescriptor::new(
            engine_type,
            instance_id,
            process,
            capabilities,
            health,
            statistics,
            metadata,
            &self.config.load,
        )))
    }

    /// Self-registration by a runtime that already knows its own state.
    pub fn announce(
        &self,
        process: RuntimeHandle,
        capabilities: Capabilities,
        health: Health,
        statistics: RuntimeStats,
        metadata: BTreeMap<String, String>,
    ) -> Arc<EngineDescriptor> {
        self.install(EngineDescriptor::new(
            process.engine_type().clone(),
            process.instance_id().clone(),
            process,
            capabilities,
            health,
            statistics,
            metadata,
            &self.config.load,
        ))
    }

    fn install(&self, mut descriptor: EngineDescriptor) -> Arc<EngineDescriptor> {
        let key = descriptor.key();
        let process = descriptor.process.clone();

        let (descriptor, fresh) = {
            let mut table = self.write();
            let previous = table.get(&key).cloned();
            let fresh = previous
                .as_ref()
                .map_or(true, |p| !p.process.same_process(&process));
            if let Some(previous) = previous.filter(|_| !fresh) {
                // Same process registering twice: the caller's metadata wins,
                // a failed introspection keeps what was already known.
                let mut metadata = previous.metadata.clone();
                metadata.append(&mut descriptor.metadata);
                if descriptor.health == Health::Unknown {
                    descriptor = previous.with_status(
                        previous.health,
                        previous.statistics.clone(),
                        &self.config.load,
                    );
                }
                descriptor.metadata = metadata;
            }
            let descriptor = Arc::new(descriptor);
            Arc::make_mut(&mut *table).insert(key.clone(), Arc::clone(&descriptor));
            (descriptor, fresh)
        };

        if fresh {
            self.watch(key.clone(), process.clone());
            info!(
                engine_type = %key.0,
                instance_id = %key.1,
                node_id = %process.node(),
                "Engine registered"
            );
            self.telemetry.emit(
                TelemetryEvent::builder(EventKind::EngineRegistered)
                    .node(process.node())
                    .engine(&key.0, &key.1)
                    .build(),
            );
        }
        descriptor
    }

    /// Spawns the death monitor for `key`, replacing any previous one.
    fn watch(&self, key: RegistryKey, process: RuntimeHandle) {
        let me = self.me.clone();
        let process_id = process.process_id().to_string();
        let watched = process_id.clone();
        let watched_key = key.clone();
        let task = tokio::spawn(async move {
            process.closed().await;
            if let Some(registry) = me.upgrade() {
                registry.handle_down(&watched_key, &watched);
            }
        })
        .abort_handle();

        if let Some(old) = self.monitors().insert(key, Monitor { process_id, task }) {
            old.task.abort();
        }
    }

    /// Removes `key` if it still belongs to the process that went down.
    fn handle_down(&self, key: &RegistryKey, process_id: &str) {
        let removed = {
            let mut table = self.write();
            let owned = table
                .get(key)
                .is_some_and(|d| d.process.process_id() == process_id);
            if owned {
                Arc::make_mut(&mut *table).remove(key)
            } else {
                None
            }
        };

        {
            let mut monitors = self.monitors();
            if monitors.get(key).is_some_and(|m| m.process_id == process_id) {
                monitors.remove(key);
            }
        }

        if let Some(descriptor) = removed {
            warn!(
                engine_type = %key.0,
                instance_id = %key.1,
                node_id = %descriptor.node,
                "Engine process down, descriptor removed"
            );
            self.telemetry.emit(
                TelemetryEvent::builder(EventKind::EngineDown)
                    .node(descriptor.node)
                    .engine(&key.0, &key.1)
                    .build(),
            );
        }
    }

    /// Removes a descriptor. Idempotent; returns what was removed.
    pub fn unregister(
        &self,
        engine_type: &EngineType,
        instance_id: &InstanceId,
    ) -> Option<Arc<EngineDescriptor>> {
        let key = (engine_type.clone(), instance_id.clone());
        let removed = {
            let mut table = self.write();
            if table.contains_key(&key) {
                Arc::make_mut(&mut *table).remove(&key)
            } else {
                None
            }
        };
        if let Some(monitor) = self.monitors().remove(&key) {
            monitor.task.abort();
        }

        if let Some(descriptor) = &removed {
            info!(engine_type = %engine_type, instance_id = %instance_id, "Engine deregistered");
            self.telemetry.emit(
                TelemetryEvent::builder(EventKind::EngineDeregistered)
                    .node(descriptor.node)
                    .engine(engine_type, instance_id)
                    .build(),
            );
        }
        removed
    }

    /// Replaces health and statistics of a registered engine and recomputes
    /// its load score.
    pub fn update_status(
        &self,
        engine_type: &EngineType,
        instance_id: &InstanceId,
        health: Health,
        statistics: RuntimeStats,
    ) -> OrchestratorResult<()> {
        let key = (engine_type.clone(), instance_id.clone());
        let mut table = self.write();
        let Some(current) = table.get(&key) else {
            return Err(OrchestratorError::not_found(format!("{engine_type}/{instance_id}")));
        };
        let updated = current.with_status(health, statistics, &self.config.load);
        debug!(
            engine_type = %engine_type,
            instance_id = %instance_id,
            health = %health,
            load_score = updated.load_score(),
            "Engine status updated"
        );
        Arc::make_mut(&mut *table).insert(key, Arc::new(updated));
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn lookup(&self, engine_type: &EngineType, instance_id: &InstanceId) -> Option<Arc<EngineDescriptor>> {
        self.snapshot()
            .get(&(engine_type.clone(), instance_id.clone()))
            .cloned()
    }

    /// All registered instances of one engine type.
    pub fn instances_of(&self, engine_type: &EngineType) -> Vec<Arc<EngineDescriptor>> {
        self.snapshot()
            .values()
            .filter(|d| d.engine_type == *engine_type)
            .cloned()
            .collect()
    }

    /// Engines providing every capability in `required` that pass `options`.
    ///
    /// Results are ordered by `(engine_type, instance_id)`.
    pub fn find_by_capability(
        &self,
        required: &Capabilities,
        options: &FindOptions,
    ) -> Vec<Arc<EngineDescriptor>> {
        self.snapshot()
            .values()
            .filter(|d| d.provides(required) && options.admits(d))
            .cloned()
            .collect()
    }

    /// Picks one engine for `criteria`, or `NoEngineAvailable`.
    pub fn get_best(&self, criteria: &SelectionCriteria) -> OrchestratorResult<Arc<EngineDescriptor>> {
        let candidates = self.find_by_capability(&criteria.capabilities, &criteria.find_options());
        let chosen = selection::select(criteria.strategy, &candidates, &criteria.capabilities, || {
            self.next_round_robin(&criteria.capabilities)
        });

        match chosen {
            Some(descriptor) => {
                self.selections[criteria.strategy.index()].fetch_add(1, Ordering::Relaxed);
                debug!(
                    strategy = %criteria.strategy,
                    candidates = candidates.len(),
                    instance_id = %descriptor.instance_id,
                    "Engine selected"
                );
                Ok(descriptor)
            }
            None => Err(OrchestratorError::NoEngineAvailable {
                capabilities: criteria.capabilities.iter().cloned().collect(),
            }),
        }
    }

    fn next_round_robin(&self, capabilities: &Capabilities) -> u64 {
        let key: Vec<String> = capabilities.iter().cloned().collect();
        let mut counters = self.round_robin.lock().unwrap_or_else(PoisonError::into_inner);
        let counter = counters.entry(key).or_insert(0);
        let current = *counter;
        *counter = counter.wrapping_add(1);
        current
    }

    pub fn list_engines(&self, filter: &EngineFilter) -> Vec<Arc<EngineDescriptor>> {
        self.snapshot()
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect()
    }

    /// Queries the live instance for its current state.
    ///
    /// Fails with `NotFound` if unregistered, `Timeout` if the instance does
    /// not answer in time, `EngineDead` if it has exited.
    pub async fn get_engine_info(
        &self,
        engine_type: &EngineType,
        instance_id: &InstanceId,
    ) -> OrchestratorResult<EngineInfo> {
        self.get_engine_info_within(engine_type, instance_id, self.config.introspection_timeout)
            .await
    }

    /// `get_engine_info` with an explicit introspection timeout.
    pub async fn get_engine_info_within(
        &self,
        engine_type: &EngineType,
        instance_id: &InstanceId,
        timeout: Duration,
    ) -> OrchestratorResult<EngineInfo> {
        let descriptor = self
            .lookup(engine_type, instance_id)
            .ok_or_else(|| OrchestratorError::not_found(format!("{engine_type}/{instance_id}")))?;
        let snapshot = descriptor.process.describe_within(timeout).await?;

        let mut live = descriptor.with_status(snapshot.health, snapshot.statistics, &self.config.load);
        live.capabilities = snapshot.capabilities;
        Ok(live.info())
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Removes descriptors that are stale or whose process has exited.
    /// Returns the number removed.
    pub fn cleanup_dead_engines(&self) -> usize {
        let now = Utc::now();
        let stale_after = self.config.stale_after;
        let is_expired = |d: &EngineDescriptor| {
            let age = now
                .signed_duration_since(d.last_seen)
                .to_std()
                .unwrap_or_default();
            age > stale_after || !d.is_alive()
        };

        let removed: Vec<Arc<EngineDescriptor>> = {
            let mut table = self.write();
            let expired: Vec<RegistryKey> = table
                .iter()
                .filter(|(_, d)| is_expired(d))
                .map(|(k, _)| k.clone())
                .collect();
            if expired.is_empty() {
                Vec::new()
            } else {
                let table = Arc::make_mut(&mut *table);
                expired.iter().filter_map(|k| table.remove(k)).collect()
            }
        };

        {
            let mut monitors = self.monitors();
            for descriptor in &removed {
                if let Some(monitor) = monitors.remove(&descriptor.key()) {
                    monitor.task.abort();
                }
            }
        }

        for descriptor in &removed {
            let reason = if descriptor.is_alive() { "stale" } else { "dead" };
            info!(
                engine_type = %descriptor.engine_type,
                instance_id = %descriptor.instance_id,
                reason,
                "Removed engine during cleanup"
            );
            self.telemetry.emit(
                TelemetryEvent::builder(EventKind::EngineDeregistered)
                    .node(descriptor.node)
                    .engine(&descriptor.engine_type, &descriptor.instance_id)
                    .meta("reason", reason)
                    .build(),
            );
        }

        self.telemetry.emit(
            TelemetryEvent::builder(EventKind::RegistryCleanup)
                .measure("removed", removed.len() as f64)
                .measure("remaining", self.len() as f64)
                .build(),
        );
        removed.len()
    }

    pub fn stats(&self) -> RegistryStats {
        let table = self.snapshot();
        let mut by_engine_type = BTreeMap::new();
        let mut by_node = BTreeMap::new();
        let mut by_health = BTreeMap::new();
        for descriptor in table.values() {
            *by_engine_type
                .entry(descriptor.engine_type.to_string())
                .or_insert(0) += 1;
            *by_node.entry(descriptor.node.to_string()).or_insert(0) += 1;
            *by_health
                .entry(descriptor.health.as_str().to_string())
                .or_insert(0) += 1;
        }

        let selections = SelectionStrategy::ALL
            .into_iter()
            .map(|s| {
                (
                    s.as_str().to_string(),
                    self.selections[s.index()].load(Ordering::Relaxed),
                )
            })
            .collect();

        RegistryStats {
            total: table.len(),
            by_engine_type,
            by_node,
            by_health,
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            selections,
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    // =========================================================================
    // Locking
    // =========================================================================

    fn snapshot(&self) -> Arc<Table> {
        Arc::clone(&self.table.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Arc<Table>> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn monitors(&self) -> MutexGuard<'_, HashMap<RegistryKey, Monitor>> {
        self.monitors.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
