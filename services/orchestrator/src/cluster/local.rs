//! In-process cluster primitive over simulated members.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use emesh_events::{EventKind, ExitReason, TelemetryEvent};
use emesh_id::{InstanceId, NodeId};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{ChildSpec, ChildStatus, ClusterSupervisor, Membership, StartOutcome};
use crate::actors::{ActorExit, ActorRef, RestartPolicy};
use crate::catalog::EngineCatalog;
use crate::config::RuntimeConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::registry::EngineRegistry;
use crate::runtime::{LaunchedRuntime, RuntimeContext, RuntimeHandle};
use crate::telemetry::TelemetrySink;

struct Child {
    spec: ChildSpec,
    node: NodeId,
    handle: RuntimeHandle,
    /// `None` between an exit and the next restart.
    actor: Option<ActorRef>,
    status: watch::Sender<ChildStatus>,
    stopping: bool,
    restarts: u32,
    /// Recent restart times, pruned to the restart window.
    history: Vec<Instant>,
}

enum Relaunch {
    Running(ActorExit),
    Failed,
    Abandoned,
}

/// Places children on the least busy live member and restarts them per
/// their restart strategy.
pub struct LocalCluster {
    catalog: EngineCatalog,
    registry: Arc<EngineRegistry>,
    telemetry: Arc<dyn TelemetrySink>,
    membership: Arc<dyn Membership>,
    settings: RuntimeConfig,
    restart: RestartPolicy,
    children: Mutex<HashMap<InstanceId, Child>>,
    /// Serializes starts so one instance id is never launched twice.
    starting: tokio::sync::Mutex<()>,
    me: Weak<LocalCluster>,
}

impl LocalCluster {
    pub fn new(
        catalog: EngineCatalog,
        registry: Arc<EngineRegistry>,
        telemetry: Arc<dyn TelemetrySink>,
        membership: Arc<dyn Membership>,
        settings: RuntimeConfig,
        restart: RestartPolicy,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            catalog,
            registry,
            telemetry,
            membership,
            settings,
            restart,
            children: Mutex::new(HashMap::new()),
            starting: tokio::sync::Mutex::new(()),
            me: me.clone(),
        })
    }

    pub fn membership(&self) -> &Arc<dyn Membership> {
        &self.membership
    }

    /// Children per member node.
    pub fn placement(&self) -> BTreeMap<NodeId, usize> {
        let mut placement = BTreeMap::new();
        for child in self.lock().values() {
            *placement.entry(child.node).or_insert(0) += 1;
        }
        placement
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Aborts a child's process as if it had died. Its restart strategy applies.
    pub fn kill(&self, instance_id: &InstanceId) -> OrchestratorResult<()> {
        let children = self.lock();
        let child = children
            .get(instance_id)
            .ok_or_else(|| OrchestratorError::not_found(format!("child {instance_id}")))?;
        warn!(instance_id = %instance_id, node_id = %child.node, "Killing engine process");
        if let Some(actor) = &child.actor {
            actor.abort();
        }
        Ok(())
    }

    /// Stops every child with reason `Shutdown`.
    pub async fn shutdown(self: &Arc<Self>, timeout: Duration) {
        let ids: Vec<InstanceId> = self.lock().keys().cloned().collect();
        info!(children = ids.len(), "Shutting down cluster children");

        let mut stops = JoinSet::new();
        for id in ids {
            let cluster = Arc::clone(self);
            stops.spawn(async move { cluster.stop_with(&id, timeout, ExitReason::Shutdown).await });
        }
        while let Some(result) = stops.join_next().await {
            if let Ok(Err(e)) = result {
                debug!(error = %e, "Child already gone during shutdown");
            }
        }
    }

    // =========================================================================
    // Placement and launch
    // =========================================================================

    /// Picks `prefer` if it is a member, else the member with the fewest
    /// children (ties broken by node id).
    fn place(&self, members: &[NodeId], prefer: Option<NodeId>) -> OrchestratorResult<NodeId> {
        if let Some(node) = prefer.filter(|n| members.contains(n)) {
            return Ok(node);
        }
        let mut load: BTreeMap<NodeId, usize> = members.iter().map(|n| (*n, 0)).collect();
        for child in self.lock().values() {
            if let Some(count) = load.get_mut(&child.node) {
                *count += 1;
            }
        }
        load.into_iter()
            .min_by_key(|(node, count)| (*count, *node))
            .map(|(node, _)| node)
            .ok_or_else(|| OrchestratorError::Placement("no live members".to_string()))
    }

    async fn launch(&self, spec: &ChildSpec, node: NodeId) -> OrchestratorResult<LaunchedRuntime> {
        let factory = self.catalog.get(&spec.engine_type)?;
        factory
            .launch(RuntimeContext {
                engine_type: spec.engine_type.clone(),
                instance_id: spec.instance_id.clone(),
                node,
                config: spec.config.clone(),
                metadata: spec.metadata.clone(),
                settings: self.settings.clone(),
                registry: Arc::clone(&self.registry),
                telemetry: Arc::clone(&self.telemetry),
            })
            .await
    }

    // =========================================================================
    // Restart handling
    // =========================================================================

    /// Decides what happens after a child exited. Returns the backoff delay
    /// if it is to be restarted.
    fn plan_restart(&self, instance_id: &InstanceId, reason: ExitReason) -> Option<Duration> {
        let mut children = self.lock();
        let child = children.get_mut(instance_id)?;
        child.actor = None;

        if child.stopping || !child.spec.restart.should_restart(reason) {
            drop(children);
            self.finish(instance_id, reason);
            return None;
        }

        let now = Instant::now();
        if !self.restart.allows_restart(&mut child.history, now) {
            error!(
                engine_type = %child.spec.engine_type,
                instance_id = %instance_id,
                restarts = child.restarts,
                "Restart limit reached, giving up on engine"
            );
            drop(children);
            self.finish(instance_id, reason);
            return None;
        }

        let attempt = child.history.len() as u32;
        child.history.push(now);
        child.status.send_replace(ChildStatus::Restarting { attempt: attempt + 1 });
        let delay = self.restart.backoff.delay(attempt);
        warn!(
            engine_type = %child.spec.engine_type,
            instance_id = %instance_id,
            reason = %reason,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "Engine exited, scheduling restart"
        );
        Some(delay)
    }

    async fn relaunch(&self, instance_id: &InstanceId, reason: ExitReason) -> Relaunch {
        let (spec, previous, stopping) = match self.lock().get(instance_id) {
            Some(child) => (child.spec.clone(), child.node, child.stopping),
            None => return Relaunch::Abandoned,
        };
        if stopping {
            self.finish(instance_id, reason);
            return Relaunch::Abandoned;
        }

        let live = self.membership.live_members();
        let node = match self.place(&live, Some(previous)) {
            Ok(node) => node,
            Err(e) => {
                error!(instance_id = %instance_id, error = %e, "Cannot place restarted engine");
                return Relaunch::Failed;
            }
        };

        let LaunchedRuntime {
            handle,
            actor,
            exit,
        } = match self.launch(&spec, node).await {
            Ok(launched) => launched,
            Err(e) => {
                error!(instance_id = %instance_id, error = %e, "Engine restart failed");
                return Relaunch::Failed;
            }
        };

        let mut children = self.lock();
        match children.get_mut(instance_id) {
            Some(child) if !child.stopping => {
                child.restarts += 1;
                child.node = node;
                child.handle = handle;
                child.actor = Some(actor);
                child.status.send_replace(ChildStatus::Running {
                    restarts: child.restarts,
                });
                info!(
                    engine_type = %spec.engine_type,
                    instance_id = %instance_id,
                    node_id = %node,
                    restarts = child.restarts,
                    "Engine restarted"
                );
                self.telemetry.emit(
                    TelemetryEvent::builder(EventKind::EngineRestarted)
                        .node(node)
                        .engine(&spec.engine_type, instance_id)
                        .measure("restarts", f64::from(child.restarts))
                        .meta("reason", reason.to_string())
                        .build(),
                );
            }
            _ => {
                // Stopped while we were relaunching; the watcher finishes it.
                drop(children);
                actor.stop();
            }
        }
        Relaunch::Running(exit)
    }

    fn finish(&self, instance_id: &InstanceId, reason: ExitReason) {
        if let Some(child) = self.lock().remove(instance_id) {
            child.status.send_replace(ChildStatus::Exited(reason));
            info!(
                engine_type = %child.spec.engine_type,
                instance_id = %instance_id,
                reason = %reason,
                restarts = child.restarts,
                "Engine will not be restarted"
            );
        }
    }

    async fn stop_with(
        &self,
        instance_id: &InstanceId,
        timeout: Duration,
        reason: ExitReason,
    ) -> OrchestratorResult<()> {
        let (handle, actor, mut status) = {
            let mut children = self.lock();
            let child = children
                .get_mut(instance_id)
                .ok_or_else(|| OrchestratorError::not_found(format!("child {instance_id}")))?;
            child.stopping = true;
            (child.handle.clone(), child.actor.clone(), child.status.subscribe())
        };

        // Without an actor the child is waiting to restart; the watcher
        // sees the stopping flag and finishes it.
        if actor.is_some() {
            if let Err(e) = handle.stop(reason).await {
                debug!(instance_id = %instance_id, error = %e, "Stop message not delivered");
            }
        }

        let exited = tokio::time::timeout(
            timeout,
            status.wait_for(|s| matches!(s, ChildStatus::Exited(_))),
        )
        .await
        .is_ok();

        if !exited {
            warn!(
                instance_id = %instance_id,
                timeout_ms = timeout.as_millis() as u64,
                "Engine did not stop in time, killing"
            );
            if let Some(actor) = actor {
                actor.abort();
            }
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<InstanceId, Child>> {
        self.children.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ClusterSupervisor for LocalCluster {
    async fn start_child(&self, spec: ChildSpec, members: &[NodeId]) -> OrchestratorResult<StartOutcome> {
        let _starting = self.starting.lock().await;

        if let Some(child) = self.lock().get(&spec.instance_id) {
            if child.stopping {
                return Err(OrchestratorError::Placement(format!(
                    "{} is stopping",
                    spec.instance_id
                )));
            }
            debug!(instance_id = %spec.instance_id, "Child already started");
            return Ok(StartOutcome::AlreadyStarted(child.handle.clone()));
        }

        let node = self.place(members, None)?;
        let LaunchedRuntime {
            handle,
            actor,
            exit,
        } = self.launch(&spec, node).await?;

        let instance_id = spec.instance_id.clone();
        let (status, _) = watch::channel(ChildStatus::Running { restarts: 0 });
        info!(
            engine_type = %spec.engine_type,
            instance_id = %instance_id,
            node_id = %node,
            restart = ?spec.restart,
            "Child started"
        );
        self.lock().insert(
            instance_id.clone(),
            Child {
                spec,
                node,
                handle: handle.clone(),
                actor: Some(actor),
                status,
                stopping: false,
                restarts: 0,
                history: Vec::new(),
            },
        );
        tokio::spawn(supervise(self.me.clone(), instance_id, exit));

        Ok(StartOutcome::Started(handle))
    }

    async fn stop_child(&self, instance_id: &InstanceId, timeout: Duration) -> OrchestratorResult<()> {
        self.stop_with(instance_id, timeout, ExitReason::Normal).await
    }

    fn monitor(&self, instance_id: &InstanceId) -> Option<watch::Receiver<ChildStatus>> {
        self.lock().get(instance_id).map(|c| c.status.subscribe())
    }

    fn handle(&self, instance_id: &InstanceId) -> Option<RuntimeHandle> {
        self.lock()
            .get(instance_id)
            .filter(|c| c.actor.is_some())
            .map(|c| c.handle.clone())
    }
}

/// Watches one child for its whole supervised life.
async fn supervise(cluster: Weak<LocalCluster>, instance_id: InstanceId, exit: ActorExit) {
    let mut reason = exit.wait().await;
    loop {
        let Some(delay) = cluster
            .upgrade()
            .and_then(|c| c.plan_restart(&instance_id, reason))
        else {
            return;
        };
        tokio::time::sleep(delay).await;

        let Some(c) = cluster.upgrade() else {
            return;
        };
        match c.relaunch(&instance_id, reason).await {
            Relaunch::Running(exit) => {
                drop(c);
                reason = exit.wait().await;
            }
            Relaunch::Failed => reason = ExitReason::Crashed,
            Relaunch::Abandoned => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use emesh_id::EngineType;
    use serde_json::json;

    use crate::actors::BackoffPolicy;
    use crate::cluster::{RestartStrategy, StaticMembership};
    use crate::config::RegistryConfig;
    use crate::engine::{capabilities, MockControls, MockEngine};
    use crate::telemetry::MemorySink;

    struct Fixture {
        cluster: Arc<LocalCluster>,
        membership: Arc<StaticMembership>,
        registry: Arc<EngineRegistry>,
        sink: Arc<MemorySink>,
        controls: MockControls,
    }

    fn analyzer() -> EngineType {
        EngineType::new("analyzer").unwrap()
    }

    fn fast_restarts(max_restarts: u32) -> RestartPolicy {
        RestartPolicy {
            max_restarts,
            window: Duration::from_secs(60),
            backoff: BackoffPolicy {
                base: Duration::from_millis(1),
                max: Duration::from_millis(5),
                jitter: 0.0,
            },
        }
    }

    fn fixture_with(catalog: EngineCatalog, controls: MockControls, policy: RestartPolicy) -> Fixture {
        let sink = Arc::new(MemorySink::new());
        let registry = EngineRegistry::new(RegistryConfig::default(), sink.clone());
        let membership = Arc::new(StaticMembership::with_size(3));
        let cluster = LocalCluster::new(
            catalog,
            registry.clone(),
            sink.clone(),
            membership.clone(),
            RuntimeConfig::default(),
            policy,
        );
        Fixture {
            cluster,
            membership,
            registry,
            sink,
            controls,
        }
    }

    fn fixture() -> Fixture {
        let controls = MockControls::new();
        let shared = controls.clone();
        let catalog = EngineCatalog::new().register(analyzer(), move || {
            MockEngine::new(capabilities(["code_analysis"])).with_controls(shared.clone())
        });
        fixture_with(catalog, controls, fast_restarts(5))
    }

    fn spec(name: &str, restart: RestartStrategy) -> ChildSpec {
        let config = json!({ "name": name });
        ChildSpec {
            engine_type: analyzer(),
            instance_id: InstanceId::derive(&analyzer(), &config),
            config,
            restart,
            shutdown_timeout: Duration::from_secs(1),
            metadata: BTreeMap::new(),
        }
    }

    impl Fixture {
        async fn start(&self, spec: ChildSpec) -> RuntimeHandle {
            let members = self.membership.live_members();
            self.cluster
                .start_child(spec, &members)
                .await
                .unwrap()
                .into_handle()
        }
    }

    async fn wait_status(
        rx: &mut watch::Receiver<ChildStatus>,
        want: impl Fn(&ChildStatus) -> bool,
    ) -> ChildStatus {
        *tokio::time::timeout(Duration::from_secs(2), rx.wait_for(want))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_children_spread_across_members() {
        let fx = fixture();
        for name in ["a", "b", "c"] {
            fx.start(spec(name, RestartStrategy::Permanent)).await;
        }
        let placement = fx.cluster.placement();
        assert_eq!(placement.len(), 3);
        assert!(placement.values().all(|n| *n == 1));
        assert_eq!(fx.registry.len(), 3);
    }

    #[tokio::test]
    async fn test_start_twice_is_already_started() {
        let fx = fixture();
        let first = fx.start(spec("a", RestartStrategy::Permanent)).await;

        let members = fx.membership.live_members();
        let outcome = fx
            .cluster
            .start_child(spec("a", RestartStrategy::Permanent), &members)
            .await
            .unwrap();
        assert!(!outcome.is_new());
        assert!(outcome.handle().same_process(&first));
        assert_eq!(fx.controls.inits(), 1);
    }

    #[tokio::test]
    async fn test_start_without_members_or_factory_fails() {
        let fx = fixture();
        let err = fx
            .cluster
            .start_child(spec("a", RestartStrategy::Permanent), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Placement(_)));

        let mut unknown = spec("b", RestartStrategy::Permanent);
        unknown.engine_type = EngineType::new("unknown").unwrap();
        let members = fx.membership.live_members();
        let err = fx.cluster.start_child(unknown, &members).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
        assert!(fx.cluster.is_empty());
    }

    #[tokio::test]
    async fn test_permanent_child_restarts_after_kill() {
        let fx = fixture();
        let s = spec("a", RestartStrategy::Permanent);
        let id = s.instance_id.clone();
        let first = fx.start(s).await;
        let mut status = fx.cluster.monitor(&id).unwrap();

        fx.cluster.kill(&id).unwrap();
        let running = wait_status(&mut status, |s| matches!(s, ChildStatus::Running { restarts: 1 })).await;
        assert_eq!(running, ChildStatus::Running { restarts: 1 });

        let second = fx.cluster.handle(&id).unwrap();
        assert!(!second.same_process(&first));
        assert!(second.is_alive());
        let descriptor = fx.registry.lookup(&analyzer(), &id).unwrap();
        assert!(descriptor.process.same_process(&second));
        assert_eq!(fx.sink.count(EventKind::EngineRestarted), 1);
        assert_eq!(fx.controls.inits(), 2);
    }

    #[tokio::test]
    async fn test_transient_child_not_restarted_after_normal_exit() {
        let fx = fixture();
        let s = spec("a", RestartStrategy::Transient);
        let id = s.instance_id.clone();
        let handle = fx.start(s).await;
        let mut status = fx.cluster.monitor(&id).unwrap();

        handle.stop(ExitReason::Normal).await.unwrap();
        let exited = wait_status(&mut status, |s| matches!(s, ChildStatus::Exited(_))).await;
        assert_eq!(exited, ChildStatus::Exited(ExitReason::Normal));
        assert!(fx.cluster.handle(&id).is_none());
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_temporary_child_not_restarted_after_kill() {
        let fx = fixture();
        let s = spec("a", RestartStrategy::Temporary);
        let id = s.instance_id.clone();
        fx.start(s).await;
        let mut status = fx.cluster.monitor(&id).unwrap();

        fx.cluster.kill(&id).unwrap();
        let exited = wait_status(&mut status, |s| matches!(s, ChildStatus::Exited(_))).await;
        assert_eq!(exited, ChildStatus::Exited(ExitReason::Killed));
        assert_eq!(fx.controls.inits(), 1);
    }

    #[tokio::test]
    async fn test_stop_child_prevents_restart() {
        let fx = fixture();
        let s = spec("a", RestartStrategy::Permanent);
        let id = s.instance_id.clone();
        fx.start(s).await;
        let mut status = fx.cluster.monitor(&id).unwrap();

        fx.cluster.stop_child(&id, Duration::from_secs(1)).await.unwrap();
        let exited = wait_status(&mut status, |s| matches!(s, ChildStatus::Exited(_))).await;
        assert_eq!(exited, ChildStatus::Exited(ExitReason::Normal));
        assert_eq!(fx.controls.terminations(), 1);
        assert_eq!(fx.controls.inits(), 1);
        assert!(fx.cluster.is_empty());

        let err = fx.cluster.stop_child(&id, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_gives_up_after_restart_limit() {
        let controls = MockControls::new();
        let launches = Arc::new(AtomicU32::new(0));
        let counter = launches.clone();
        let catalog = EngineCatalog::new().register(analyzer(), move || {
            let caps = capabilities(["code_analysis"]);
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                MockEngine::new(caps)
            } else {
                MockEngine::failing_init(caps)
            }
        });
        let fx = fixture_with(catalog, controls, fast_restarts(2));
        let s = spec("a", RestartStrategy::Permanent);
        let id = s.instance_id.clone();
        fx.start(s).await;
        let mut status = fx.cluster.monitor(&id).unwrap();

        fx.cluster.kill(&id).unwrap();
        let exited = wait_status(&mut status, |s| matches!(s, ChildStatus::Exited(_))).await;
        assert_eq!(exited, ChildStatus::Exited(ExitReason::Crashed));
        // The first launch plus two failed restarts.
        assert_eq!(launches.load(Ordering::SeqCst), 3);
        assert!(fx.cluster.is_empty());
    }

    #[tokio::test]
    async fn test_restart_moves_off_downed_member() {
        let fx = fixture();
        let s = spec("a", RestartStrategy::Permanent);
        let id = s.instance_id.clone();
        let first = fx.start(s).await;
        let mut status = fx.cluster.monitor(&id).unwrap();

        fx.membership.set_down(first.node());
        fx.cluster.kill(&id).unwrap();
        wait_status(&mut status, |s| matches!(s, ChildStatus::Running { restarts: 1 })).await;

        let second = fx.cluster.handle(&id).unwrap();
        assert_ne!(second.node(), first.node());
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let fx = fixture();
        for name in ["a", "b"] {
            fx.start(spec(name, RestartStrategy::Permanent)).await;
        }
        fx.cluster.shutdown(Duration::from_secs(1)).await;
        assert!(fx.cluster.is_empty());
        assert!(fx.registry.is_empty());
        assert_eq!(fx.controls.terminations(), 2);
    }
}
