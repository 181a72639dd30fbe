//! enginemesh node
//!
//! Boots the orchestration core over a simulated cluster and runs until
//! Ctrl-C.
//!
//! - **Cluster**: `EMESH_CLUSTER_SIZE` in-process members
//! - **Engines**: a demo `code_analysis` engine, started once
//! - **Cleanup**: periodic dead-engine sweep of the registry
//! - **Health**: cluster distribution logged every cleanup interval

use std::sync::Arc;

use anyhow::Result;
use emesh_id::EngineType;
use emesh_orchestrator::actors::RestartPolicy;
use emesh_orchestrator::engine::capabilities;
use emesh_orchestrator::registry::run_cleanup_loop;
use emesh_orchestrator::{
    Config, EngineCatalog, EngineRegistry, EngineSupervisor, LocalCluster, MockEngine,
    SelectionCriteria, StaticMembership, TelemetrySink, TracingSink,
};
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // RUST_LOG overrides EMESH_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        node_id = %config.node_id,
        cluster_size = config.cluster_size,
        default_strategy = %config.default_strategy,
        "Starting enginemesh node"
    );

    let telemetry: Arc<dyn TelemetrySink> = Arc::new(TracingSink);
    let registry = EngineRegistry::new(config.registry.clone(), Arc::clone(&telemetry));

    let mut nodes = vec![config.node_id];
    nodes.extend((1..config.cluster_size).map(|_| emesh_id::NodeId::new()));
    let membership = Arc::new(StaticMembership::new(nodes));

    let code_analysis = EngineType::new("code_analysis")?;
    let catalog = EngineCatalog::new().register(code_analysis.clone(), || {
        MockEngine::new(capabilities(["code_analysis", "syntax_check"]))
    });

    let cluster = LocalCluster::new(
        catalog,
        Arc::clone(&registry),
        Arc::clone(&telemetry),
        membership.clone(),
        config.runtime.clone(),
        RestartPolicy::default(),
    );
    let supervisor = Arc::new(EngineSupervisor::new(
        config.supervisor.clone(),
        cluster.clone(),
        membership,
        Arc::clone(&registry),
        Arc::clone(&telemetry),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let cleanup_handle = tokio::spawn(run_cleanup_loop(
        Arc::clone(&registry),
        config.cleanup_interval,
        shutdown_rx.clone(),
    ));

    let health_handle = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        let mut shutdown_rx = shutdown_rx.clone();
        let period = config.cleanup_interval;
        async move {
            let mut timer = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let health = supervisor.cluster_health();
                        info!(
                            total_nodes = health.total_nodes,
                            active_nodes = health.active_nodes,
                            total_engines = health.total_engines,
                            distribution_balance = health.distribution_balance,
                            "Cluster health"
                        );
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }
    });

    match supervisor
        .ensure_engine(code_analysis, json!({ "profile": "default" }))
        .await
    {
        Ok(handle) => {
            let criteria = SelectionCriteria::new(capabilities(["code_analysis"]))
                .strategy(config.default_strategy);
            match registry.get_best(&criteria) {
                Ok(best) => info!(
                    instance_id = %best.instance_id,
                    node_id = %best.node,
                    load_score = best.load_score(),
                    "Demo engine selectable"
                ),
                Err(e) => warn!(error = %e, "Demo engine not selectable"),
            }
            if let Err(e) = handle.process_real_time(json!({ "source": "fn main() {}" })).await {
                warn!(error = %e, "Demo request failed");
            }
        }
        Err(e) => error!(error = %e, "Failed to start demo engine"),
    }

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);
    cluster.shutdown(config.supervisor.shutdown_timeout).await;

    if let Err(e) = cleanup_handle.await {
        error!(error = %e, "Cleanup task panicked");
    }
    if let Err(e) = health_handle.await {
        error!(error = %e, "Health task panicked");
    }

    info!("enginemesh node shutdown complete");
    Ok(())
}
