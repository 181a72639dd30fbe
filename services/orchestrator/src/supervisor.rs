//! Engine supervisor: lifecycle of engine instances across the cluster.
//!
//! The supervisor derives instance ids, drives the cluster primitive to
//! start and stop children, keeps the registry in step and remembers each
//! instance's start config for restarts.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use emesh_events::{EventKind, ExitReason, TelemetryEvent};
use emesh_id::{EngineType, InstanceId, NodeId};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cluster::{
    ChildSpec, ChildStatus, ClusterSupervisor, Membership, RestartStrategy, StartOutcome,
};
use crate::config::SupervisorConfig;
use crate::engine::EngineConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::registry::{EngineFilter, EngineInfo, EngineRegistry};
use crate::runtime::RuntimeHandle;
use crate::telemetry::TelemetrySink;

/// Options for `start_engine`. Unset fields use the supervisor defaults.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub restart: Option<RestartStrategy>,
    pub shutdown_timeout: Option<Duration>,
    pub metadata: BTreeMap<String, String>,
}

impl StartOptions {
    pub fn restart(mut self, restart: RestartStrategy) -> Self {
        self.restart = Some(restart);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Engine distribution over the cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterHealth {
    pub total_nodes: usize,
    pub active_nodes: usize,
    pub total_engines: usize,
    /// Engines on each active node, zero counts included.
    pub engines_per_node: BTreeMap<NodeId, usize>,
    /// 1.0 for a perfectly even spread, falling towards 0.0 as it skews.
    pub distribution_balance: f64,
}

/// `max(0, 1 - cv)` over per-node engine counts, where `cv` is the
/// population coefficient of variation. 1.0 with at most one node or no
/// engines.
pub fn distribution_balance(counts: &[usize]) -> f64 {
    if counts.len() <= 1 {
        return 1.0;
    }
    let n = counts.len() as f64;
    let mean = counts.iter().sum::<usize>() as f64 / n;
    if mean == 0.0 {
        return 1.0;
    }
    let variance = counts
        .iter()
        .map(|c| {
            let d = *c as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    (1.0 - variance.sqrt() / mean).max(0.0)
}

/// Starts, stops and restarts engines through the cluster primitive.
pub struct EngineSupervisor {
    config: SupervisorConfig,
    cluster: Arc<dyn ClusterSupervisor>,
    membership: Arc<dyn Membership>,
    registry: Arc<EngineRegistry>,
    telemetry: Arc<dyn TelemetrySink>,
    /// Start specs of live children, dropped once the cluster gives up on them.
    specs: Arc<Mutex<HashMap<InstanceId, ChildSpec>>>,
    /// Serializes `ensure_engine` lookups with the start they may trigger.
    ensuring: tokio::sync::Mutex<()>,
}

impl EngineSupervisor {
    pub fn new(
        config: SupervisorConfig,
        cluster: Arc<dyn ClusterSupervisor>,
        membership: Arc<dyn Membership>,
        registry: Arc<EngineRegistry>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            config,
            cluster,
            membership,
            registry,
            telemetry,
            specs: Arc::new(Mutex::new(HashMap::new())),
            ensuring: tokio::sync::Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    /// Starts a new instance of `engine_type` somewhere in the cluster and
    /// registers it. Starting an already running instance succeeds.
    pub async fn start_engine(
        &self,
        engine_type: EngineType,
        config: EngineConfig,
        options: StartOptions,
    ) -> OrchestratorResult<RuntimeHandle> {
        let instance_id = InstanceId::derive(&engine_type, &config);
        let spec = ChildSpec {
            engine_type: engine_type.clone(),
            instance_id: instance_id.clone(),
            config,
            restart: options.restart.unwrap_or(self.config.default_restart),
            shutdown_timeout: options.shutdown_timeout.unwrap_or(self.config.shutdown_timeout),
            metadata: options.metadata,
        };

        let members = self.membership.live_members();
        let outcome = self.cluster.start_child(spec.clone(), &members).await?;
        let handle = match outcome {
            StartOutcome::AlreadyStarted(handle) => {
                debug!(engine_type = %engine_type, instance_id = %instance_id, "Engine already started");
                return Ok(handle);
            }
            StartOutcome::Started(handle) => handle,
        };

        if let Err(e) = self
            .registry
            .register(
                engine_type.clone(),
                instance_id.clone(),
                handle.clone(),
                spec.metadata.clone(),
            )
            .await
        {
            warn!(instance_id = %instance_id, error = %e, "Registration failed, stopping engine");
            if let Err(stop_error) = self.cluster.stop_child(&instance_id, spec.shutdown_timeout).await {
                debug!(instance_id = %instance_id, error = %stop_error, "Engine already gone");
            }
            return Err(e);
        }
        self.specs().insert(instance_id.clone(), spec);
        self.forget_on_exit(instance_id.clone());

        info!(
            engine_type = %engine_type,
            instance_id = %instance_id,
            node_id = %handle.node(),
            "Engine started"
        );
        self.telemetry.emit(
            TelemetryEvent::builder(EventKind::EngineStarted)
                .node(handle.node())
                .engine(&engine_type, &instance_id)
                .build(),
        );
        Ok(handle)
    }

    /// Stops an instance. Without `instance_id` the type must have exactly
    /// one registered instance.
    pub async fn stop_engine(
        &self,
        engine_type: &EngineType,
        instance_id: Option<&InstanceId>,
    ) -> OrchestratorResult<()> {
        let instance_id = self.resolve(engine_type, instance_id)?;
        let descriptor = self.registry.unregister(engine_type, &instance_id);
        let timeout = self
            .specs()
            .remove(&instance_id)
            .map_or(self.config.shutdown_timeout, |s| s.shutdown_timeout);

        match self.cluster.stop_child(&instance_id, timeout).await {
            Ok(()) => {}
            // Registered but not cluster managed: stop the process directly.
            Err(OrchestratorError::NotFound(_)) if descriptor.is_some() => {
                if let Some(d) = &descriptor {
                    if let Err(e) = d.process.stop(ExitReason::Normal).await {
                        debug!(instance_id = %instance_id, error = %e, "Engine already gone");
                    }
                }
            }
            Err(e) => return Err(e),
        }

        info!(engine_type = %engine_type, instance_id = %instance_id, "Engine stopped");
        let mut event = TelemetryEvent::builder(EventKind::EngineStopped).engine(engine_type, &instance_id);
        if let Some(d) = &descriptor {
            event = event.node(d.node);
        }
        self.telemetry.emit(event.build());
        Ok(())
    }

    /// Stops an instance and starts a new one with the same config.
    pub async fn restart_engine(
        &self,
        engine_type: &EngineType,
        instance_id: Option<&InstanceId>,
    ) -> OrchestratorResult<RuntimeHandle> {
        let instance_id = self.resolve(engine_type, instance_id)?;
        let spec = self.specs().get(&instance_id).cloned().ok_or_else(|| {
            OrchestratorError::MissingConfig {
                engine_type: engine_type.clone(),
                instance_id: instance_id.clone(),
            }
        })?;

        info!(engine_type = %engine_type, instance_id = %instance_id, "Restarting engine");
        self.stop_engine(engine_type, Some(&instance_id)).await?;
        self.start_engine(
            spec.engine_type,
            spec.config,
            StartOptions {
                restart: Some(spec.restart),
                shutdown_timeout: Some(spec.shutdown_timeout),
                metadata: spec.metadata,
            },
        )
        .await
    }

    /// Returns a live instance of `engine_type`, starting one if none runs.
    pub async fn ensure_engine(
        &self,
        engine_type: EngineType,
        config: EngineConfig,
    ) -> OrchestratorResult<RuntimeHandle> {
        let _ensuring = self.ensuring.lock().await;
        let live = self
            .registry
            .instances_of(&engine_type)
            .into_iter()
            .find(|d| d.is_alive());
        match live {
            Some(descriptor) => Ok(descriptor.process.clone()),
            None => {
                self.start_engine(engine_type, config, StartOptions::default())
                    .await
            }
        }
    }

    pub fn list_engines(&self, filter: &EngineFilter) -> Vec<EngineInfo> {
        self.registry
            .list_engines(filter)
            .iter()
            .map(|d| d.info())
            .collect()
    }

    /// Live state of one instance, bounded by the introspection timeout.
    pub async fn get_engine_info(
        &self,
        engine_type: &EngineType,
        instance_id: &InstanceId,
    ) -> OrchestratorResult<EngineInfo> {
        self.registry
            .get_engine_info_within(engine_type, instance_id, self.config.introspection_timeout)
            .await
    }

    pub fn cluster_health(&self) -> ClusterHealth {
        let total_nodes = self.membership.members().len();
        let mut engines_per_node: BTreeMap<NodeId, usize> = self
            .membership
            .live_members()
            .into_iter()
            .map(|n| (n, 0))
            .collect();

        let engines = self.registry.list_engines(&EngineFilter::default());
        for descriptor in &engines {
            if let Some(count) = engines_per_node.get_mut(&descriptor.node) {
                *count += 1;
            }
        }

        let counts: Vec<usize> = engines_per_node.values().copied().collect();
        ClusterHealth {
            total_nodes,
            active_nodes: engines_per_node.len(),
            total_engines: engines.len(),
            distribution_balance: distribution_balance(&counts),
            engines_per_node,
        }
    }

    fn resolve(
        &self,
        engine_type: &EngineType,
        instance_id: Option<&InstanceId>,
    ) -> OrchestratorResult<InstanceId> {
        if let Some(id) = instance_id {
            let known = self.registry.lookup(engine_type, id).is_some()
                || self
                    .specs()
                    .get(id)
                    .is_some_and(|s| s.engine_type == *engine_type);
            return if known {
                Ok(id.clone())
            } else {
                Err(OrchestratorError::not_found(format!("{engine_type}/{id}")))
            };
        }

        let mut instances = self.registry.instances_of(engine_type);
        match instances.len() {
            0 => Err(OrchestratorError::not_found(format!("engine type {engine_type}"))),
            1 => Ok(instances.remove(0).instance_id.clone()),
            count => {
                warn!(engine_type = %engine_type, count, "Ambiguous engine lookup");
                Err(OrchestratorError::MultipleMatches {
                    engine_type: engine_type.clone(),
                    count,
                })
            }
        }
    }

    /// Drops the remembered spec once the cluster reports the child exited
    /// for good.
    fn forget_on_exit(&self, instance_id: InstanceId) {
        let Some(mut status) = self.cluster.monitor(&instance_id) else {
            self.specs().remove(&instance_id);
            return;
        };
        let specs = Arc::clone(&self.specs);
        let cluster: Weak<dyn ClusterSupervisor> = Arc::downgrade(&self.cluster);
        tokio::spawn(async move {
            // A dropped sender also means the child is gone.
            let _ = status
                .wait_for(|s| matches!(s, ChildStatus::Exited(_)))
                .await;
            // Same id started again in the meantime
            if cluster
                .upgrade()
                .is_some_and(|c| c.handle(&instance_id).is_some())
            {
                return;
            }
            if lock_specs(&specs).remove(&instance_id).is_some() {
                debug!(instance_id = %instance_id, "Forgot config of exited engine");
            }
        });
    }

    fn specs(&self) -> MutexGuard<'_, HashMap<InstanceId, ChildSpec>> {
        lock_specs(&self.specs)
    }
}

fn lock_specs(
    specs: &Mutex<HashMap<InstanceId, ChildSpec>>,
) -> MutexGuard<'_, HashMap<InstanceId, ChildSpec>> {
    specs.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    use crate::actors::RestartPolicy;
    use crate::catalog::EngineCatalog;
    use crate::cluster::{LocalCluster, StaticMembership};
    use crate::config::{RegistryConfig, RuntimeConfig};
    use crate::engine::{capabilities, MockEngine};
    use crate::runtime::{spawn_runtime, RuntimeContext};
    use crate::telemetry::MemorySink;

    #[rstest]
    #[case(&[], 1.0)]
    #[case(&[7], 1.0)]
    #[case(&[0, 0, 0], 1.0)]
    #[case(&[2, 2, 2], 1.0)]
    #[case(&[3, 0, 0], 0.0)]
    #[case(&[1, 3], 0.5)]
    fn test_distribution_balance(#[case] counts: &[usize], #[case] expected: f64) {
        assert!((distribution_balance(counts) - expected).abs() < 1e-9);
    }

    fn analyzer() -> EngineType {
        EngineType::new("analyzer").unwrap()
    }

    struct Fixture {
        supervisor: EngineSupervisor,
        cluster: Arc<LocalCluster>,
        registry: Arc<EngineRegistry>,
        sink: Arc<MemorySink>,
    }

    fn fixture() -> Fixture {
        let sink = Arc::new(MemorySink::new());
        let registry = EngineRegistry::new(RegistryConfig::default(), sink.clone());
        let membership = Arc::new(StaticMembership::with_size(2));
        let catalog = EngineCatalog::new()
            .register(analyzer(), || MockEngine::new(capabilities(["code_analysis"])));
        let cluster = LocalCluster::new(
            catalog,
            registry.clone(),
            sink.clone(),
            membership.clone(),
            RuntimeConfig::default(),
            RestartPolicy::default(),
        );
        Fixture {
            supervisor: EngineSupervisor::new(
                SupervisorConfig::default(),
                cluster.clone(),
                membership,
                registry.clone(),
                sink.clone(),
            ),
            cluster,
            registry,
            sink,
        }
    }

    #[tokio::test]
    async fn test_stop_without_id_requires_single_instance() {
        let fx = fixture();
        fx.supervisor
            .start_engine(analyzer(), json!({"n": 1}), StartOptions::default())
            .await
            .unwrap();
        fx.supervisor
            .start_engine(analyzer(), json!({"n": 2}), StartOptions::default())
            .await
            .unwrap();

        let err = fx.supervisor.stop_engine(&analyzer(), None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::MultipleMatches { count: 2, .. }));
        assert_eq!(fx.registry.len(), 2);
    }

    #[tokio::test]
    async fn test_stop_unknown_type_is_not_found() {
        let fx = fixture();
        let err = fx.supervisor.stop_engine(&analyzer(), None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_restart_without_recorded_config() {
        let fx = fixture();
        let config = json!({});
        let ctx = RuntimeContext {
            engine_type: analyzer(),
            instance_id: InstanceId::derive(&analyzer(), &config),
            node: NodeId::new(),
            config,
            metadata: BTreeMap::new(),
            settings: RuntimeConfig::default(),
            registry: fx.registry.clone(),
            telemetry: fx.sink.clone(),
        };
        let launched = spawn_runtime(MockEngine::new(capabilities(["x"])), ctx)
            .await
            .unwrap();

        let err = fx
            .supervisor
            .restart_engine(&analyzer(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::MissingConfig { .. }));
        assert!(launched.handle.is_alive());

        // Unmanaged engines can still be stopped.
        fx.supervisor.stop_engine(&analyzer(), None).await.unwrap();
        launched.exit.wait().await;
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_cluster_health_counts_active_nodes() {
        let fx = fixture();
        for n in 0..4 {
            fx.supervisor
                .start_engine(analyzer(), json!({ "n": n }), StartOptions::default())
                .await
                .unwrap();
        }
        let health = fx.supervisor.cluster_health();
        assert_eq!(health.total_nodes, 2);
        assert_eq!(health.active_nodes, 2);
        assert_eq!(health.total_engines, 4);
        assert!(health.engines_per_node.values().all(|c| *c == 2));
        assert_eq!(health.distribution_balance, 1.0);
    }

    #[tokio::test]
    async fn test_exited_child_config_is_forgotten() {
        let fx = fixture();
        let handle = fx
            .supervisor
            .start_engine(
                analyzer(),
                json!({"n": 1}),
                StartOptions::default().restart(RestartStrategy::Temporary),
            )
            .await
            .unwrap();
        let instance_id = handle.instance_id().clone();
        assert!(fx.supervisor.specs().contains_key(&instance_id));

        fx.cluster.kill(&instance_id).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while fx.supervisor.specs().contains_key(&instance_id) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(fx.cluster.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_ensure_starts_one_instance() {
        let fx = fixture();
        let (first, second) = tokio::join!(
            fx.supervisor.ensure_engine(analyzer(), json!({"profile": "a"})),
            fx.supervisor.ensure_engine(analyzer(), json!({"profile": "b"})),
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        assert!(first.same_process(&second));
        assert_eq!(fx.registry.instances_of(&analyzer()).len(), 1);
        assert_eq!(fx.cluster.len(), 1);
    }

    /// Hands out runtimes that are already dead and records stop requests.
    struct DeadOnArrival {
        registry: Arc<EngineRegistry>,
        sink: Arc<MemorySink>,
        stopped: Mutex<Vec<InstanceId>>,
    }

    #[async_trait::async_trait]
    impl ClusterSupervisor for DeadOnArrival {
        async fn start_child(
            &self,
            spec: ChildSpec,
            members: &[NodeId],
        ) -> OrchestratorResult<StartOutcome> {
            let ctx = RuntimeContext {
                engine_type: spec.engine_type,
                instance_id: spec.instance_id,
                node: members[0],
                config: spec.config,
                metadata: spec.metadata,
                settings: RuntimeConfig::default(),
                registry: self.registry.clone(),
                telemetry: self.sink.clone(),
            };
            let launched = spawn_runtime(MockEngine::new(capabilities(["x"])), ctx).await?;
            launched.handle.stop(ExitReason::Normal).await?;
            launched.exit.wait().await;
            Ok(StartOutcome::Started(launched.handle))
        }

        async fn stop_child(&self, instance_id: &InstanceId, _timeout: Duration) -> OrchestratorResult<()> {
            self.stopped.lock().unwrap().push(instance_id.clone());
            Ok(())
        }

        fn monitor(&self, _instance_id: &InstanceId) -> Option<tokio::sync::watch::Receiver<ChildStatus>> {
            None
        }

        fn handle(&self, _instance_id: &InstanceId) -> Option<RuntimeHandle> {
            None
        }
    }

    #[tokio::test]
    async fn test_failed_registration_stops_child() {
        let sink = Arc::new(MemorySink::new());
        let registry = EngineRegistry::new(RegistryConfig::default(), sink.clone());
        let cluster = Arc::new(DeadOnArrival {
            registry: registry.clone(),
            sink: sink.clone(),
            stopped: Mutex::new(Vec::new()),
        });
        let supervisor = EngineSupervisor::new(
            SupervisorConfig::default(),
            cluster.clone(),
            Arc::new(StaticMembership::with_size(1)),
            registry.clone(),
            sink.clone(),
        );

        let err = supervisor
            .start_engine(analyzer(), json!({}), StartOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::EngineDead { .. }));

        let stopped = cluster.stopped.lock().unwrap().clone();
        assert_eq!(stopped.len(), 1);
        assert!(supervisor.specs().is_empty());
        assert!(registry.is_empty());
        assert_eq!(sink.count(EventKind::EngineStarted), 0);
    }
}
