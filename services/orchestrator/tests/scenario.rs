//! One engine through its whole life: discovery, real-time traffic,
//! overload, failing health and a crash that is not restarted.

use std::sync::Arc;
use std::time::Duration;

use emesh_events::EventKind;
use emesh_id::EngineType;
use emesh_orchestrator::actors::RestartPolicy;
use emesh_orchestrator::config::{RegistryConfig, RuntimeConfig, SupervisorConfig};
use emesh_orchestrator::engine::{capabilities, MockControls};
use emesh_orchestrator::registry::FindOptions;
use emesh_orchestrator::runtime::ProcessOptions;
use emesh_orchestrator::{
    EngineCatalog, EngineRegistry, EngineSupervisor, Health, LocalCluster, MemorySink, MockEngine,
    Mode, RestartStrategy, StartOptions, StaticMembership,
};
use serde_json::json;

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_engine_lifecycle() {
    let code_analysis = EngineType::new("code_analysis").unwrap();
    let controls = MockControls::new();

    let sink = Arc::new(MemorySink::new());
    let registry = EngineRegistry::new(RegistryConfig::default(), sink.clone());
    let membership = Arc::new(StaticMembership::with_size(2));
    let catalog = EngineCatalog::new().register(code_analysis.clone(), {
        let controls = controls.clone();
        move || MockEngine::new(capabilities(["code_analysis"])).with_controls(controls.clone())
    });
    let cluster = LocalCluster::new(
        catalog,
        registry.clone(),
        sink.clone(),
        membership.clone(),
        RuntimeConfig::default(),
        RestartPolicy::default(),
    );
    let supervisor = EngineSupervisor::new(
        SupervisorConfig::default(),
        cluster.clone(),
        membership,
        registry.clone(),
        sink.clone(),
    );

    // Start and discover
    let engine = supervisor
        .start_engine(
            code_analysis.clone(),
            json!({ "rules": "default" }),
            StartOptions::default().restart(RestartStrategy::Temporary),
        )
        .await
        .unwrap();
    let found = registry.find_by_capability(&capabilities(["code_analysis"]), &FindOptions::default());
    assert_eq!(found.len(), 1);
    assert_eq!(&found[0].instance_id, engine.instance_id());

    // Urgent traffic moves the engine into real time
    let output = engine
        .process_real_time_with(json!({ "source": "fn main() {}" }), ProcessOptions::urgent())
        .await
        .unwrap();
    assert_eq!(output.mode, Mode::RealTime);

    // Resource pressure overrides the cooldown
    engine.report_load(0.9, 0.1).await.unwrap();
    let snapshot = engine.mode_snapshot().await.unwrap();
    assert_eq!(snapshot.mode, Mode::Overloaded);
    assert_eq!(snapshot.previous_mode, Some(Mode::RealTime));
    let overloaded = sink
        .of_kind(EventKind::EngineModeChanged)
        .iter()
        .any(|e| e.meta_str("to").ok().flatten() == Some("overloaded"));
    assert!(overloaded);

    // Failing health forces recovery and hides the engine from discovery
    controls.set_health(Health::Unhealthy);
    assert_eq!(engine.check_health().await.unwrap(), Health::Unhealthy);
    assert_eq!(engine.mode_snapshot().await.unwrap().mode, Mode::Recovery);
    assert!(registry
        .find_by_capability(&capabilities(["code_analysis"]), &FindOptions::default())
        .is_empty());
    assert_eq!(sink.count(EventKind::EngineHealthChanged), 1);

    // A temporary engine that dies stays dead and leaves the registry
    cluster.kill(engine.instance_id()).unwrap();
    eventually("registry to drop the engine", || registry.is_empty()).await;
    eventually("cluster to forget the engine", || cluster.is_empty()).await;
    assert!(!engine.is_alive());
    assert_eq!(sink.count(EventKind::EngineRestarted), 0);
    assert_eq!(controls.inits(), 1);
}
