//! Discovery and selection through the public registry API.

use std::collections::BTreeMap;
use std::sync::Arc;

use emesh_id::EngineType;
use emesh_orchestrator::actors::RestartPolicy;
use emesh_orchestrator::config::{RegistryConfig, RuntimeConfig, SupervisorConfig};
use emesh_orchestrator::engine::capabilities;
use emesh_orchestrator::registry::{EngineFilter, FindOptions};
use emesh_orchestrator::{
    EngineCatalog, EngineRegistry, EngineSupervisor, LocalCluster, MockEngine, OrchestratorError,
    SelectionCriteria, SelectionStrategy, StartOptions, StaticMembership, TelemetrySink,
    TracingSink,
};
use serde_json::json;

struct Mesh {
    supervisor: EngineSupervisor,
    registry: Arc<EngineRegistry>,
}

fn engine_type(name: &str) -> EngineType {
    EngineType::new(name).unwrap()
}

fn mesh() -> Mesh {
    let telemetry: Arc<dyn TelemetrySink> = Arc::new(TracingSink);
    let registry = EngineRegistry::new(RegistryConfig::default(), telemetry.clone());
    let membership = Arc::new(StaticMembership::with_size(2));
    let catalog = EngineCatalog::new()
        .register(engine_type("analyzer"), || {
            MockEngine::new(capabilities(["code_analysis", "syntax_check"]))
        })
        .register(engine_type("linter"), || MockEngine::new(capabilities(["syntax_check"])));
    let cluster = LocalCluster::new(
        catalog,
        registry.clone(),
        telemetry.clone(),
        membership.clone(),
        RuntimeConfig::default(),
        RestartPolicy::default(),
    );
    Mesh {
        supervisor: EngineSupervisor::new(
            SupervisorConfig::default(),
            cluster,
            membership,
            registry.clone(),
            telemetry,
        ),
        registry,
    }
}

impl Mesh {
    async fn start(&self, name: &str, n: u32) {
        self.supervisor
            .start_engine(engine_type(name), json!({ "n": n }), StartOptions::default())
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_capability_discovery_requires_superset() {
    let mesh = mesh();
    mesh.start("analyzer", 1).await;
    mesh.start("linter", 1).await;

    let both = mesh
        .registry
        .find_by_capability(&capabilities(["syntax_check"]), &FindOptions::default());
    assert_eq!(both.len(), 2);

    let analyzers = mesh.registry.find_by_capability(
        &capabilities(["code_analysis", "syntax_check"]),
        &FindOptions::default(),
    );
    assert_eq!(analyzers.len(), 1);
    assert_eq!(analyzers[0].engine_type, engine_type("analyzer"));

    let none = mesh
        .registry
        .find_by_capability(&capabilities(["translation"]), &FindOptions::default());
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_round_robin_is_fair() {
    let mesh = mesh();
    mesh.start("linter", 1).await;
    mesh.start("linter", 2).await;
    mesh.start("linter", 3).await;

    let criteria = SelectionCriteria::new(capabilities(["syntax_check"]))
        .strategy(SelectionStrategy::RoundRobin);
    let mut picks: BTreeMap<String, usize> = BTreeMap::new();
    for _ in 0..9 {
        let chosen = mesh.registry.get_best(&criteria).unwrap();
        *picks.entry(chosen.instance_id.to_string()).or_default() += 1;
    }

    assert_eq!(picks.len(), 3);
    assert!(picks.values().all(|n| *n == 3));
    assert_eq!(mesh.registry.stats().selections.get("round_robin"), Some(&9));
}

#[tokio::test]
async fn test_get_best_without_candidates() {
    let mesh = mesh();
    mesh.start("linter", 1).await;

    let err = mesh
        .registry
        .get_best(&SelectionCriteria::new(capabilities(["code_analysis"])))
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NoEngineAvailable { .. }));
}

#[tokio::test]
async fn test_list_and_stats_by_type() {
    let mesh = mesh();
    mesh.start("analyzer", 1).await;
    mesh.start("linter", 1).await;
    mesh.start("linter", 2).await;

    let linters = mesh
        .supervisor
        .list_engines(&EngineFilter::engine_type(engine_type("linter")));
    assert_eq!(linters.len(), 2);
    assert!(linters.iter().all(|info| info.engine_type == engine_type("linter")));

    let stats = mesh.registry.stats();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.by_engine_type.get("linter"), Some(&2));
    assert_eq!(stats.by_engine_type.get("analyzer"), Some(&1));

    let encoded = serde_json::to_value(&linters[0]).unwrap();
    assert_eq!(encoded["engine_type"], "linter");
}
