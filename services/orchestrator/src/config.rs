//! Configuration for the orchestration core and the node binary.

use std::time::Duration;

use anyhow::{Context, Result};
use emesh_id::NodeId;
use tracing::warn;

use crate::cluster::RestartStrategy;
use crate::mode::ModeConfig;
use crate::registry::{LoadWeights, SelectionStrategy};

/// Engine runtime settings.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Deadline for real-time calls.
    pub realtime_timeout: Duration,

    /// Interval between periodic health checks.
    pub health_check_interval: Duration,

    /// Upper bound on a single engine health check.
    pub health_check_timeout: Duration,

    pub mailbox_size: usize,

    /// Advisory concurrency limit at start and its ceiling.
    pub base_concurrency: u32,
    pub max_concurrency: u32,

    pub mode: ModeConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            realtime_timeout: Duration::from_millis(100),
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            mailbox_size: 256,
            base_concurrency: 16,
            max_concurrency: 256,
            mode: ModeConfig::default(),
        }
    }
}

/// Engine registry settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Descriptors not refreshed for this long are swept.
    pub stale_after: Duration,

    /// Bound on introspection round trips to a runtime.
    pub introspection_timeout: Duration,

    pub load: LoadWeights,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(300),
            introspection_timeout: Duration::from_secs(5),
            load: LoadWeights::default(),
        }
    }
}

/// Supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub introspection_timeout: Duration,

    /// Restart strategy for engines started without an explicit one.
    pub default_restart: RestartStrategy,

    /// How long a stopping engine may take before it is killed.
    pub shutdown_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            introspection_timeout: Duration::from_secs(5),
            default_restart: RestartStrategy::Permanent,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Node configuration, loaded from `EMESH_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifier of this node.
    pub node_id: NodeId,

    /// Number of simulated cluster members (this node included).
    pub cluster_size: usize,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Interval of the dead-engine sweep.
    pub cleanup_interval: Duration,

    /// Strategy used when callers do not pick one.
    pub default_strategy: SelectionStrategy,

    pub runtime: RuntimeConfig,
    pub registry: RegistryConfig,
    pub supervisor: SupervisorConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let nonzero = |key: &str, default: u64| -> u64 {
            let Some(raw) = lookup(key) else {
                return default;
            };
            match raw.parse::<u64>() {
                Ok(0) => {
                    warn!(key, default, "Zero is not allowed, using default");
                    default
                }
                Ok(value) => value,
                Err(_) => {
                    warn!(key, value = %raw, default, "Unparsable value, using default");
                    default
                }
            }
        };

        // Node ID can be provided or auto-generated
        let node_id = match lookup("EMESH_NODE_ID") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("invalid EMESH_NODE_ID: {raw}"))?,
            None => NodeId::new(),
        };

        let default_strategy = match lookup("EMESH_DEFAULT_STRATEGY") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("invalid EMESH_DEFAULT_STRATEGY: {raw}"))?,
            None => SelectionStrategy::LeastLoaded,
        };

        let log_level = lookup("EMESH_LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        let introspection_timeout =
            Duration::from_millis(nonzero("EMESH_INTROSPECTION_TIMEOUT_MS", 5_000));

        let runtime = RuntimeConfig {
            realtime_timeout: Duration::from_millis(nonzero("EMESH_REALTIME_TIMEOUT_MS", 100)),
            health_check_interval: Duration::from_secs(nonzero(
                "EMESH_HEALTH_CHECK_INTERVAL_SECS",
                30,
            )),
            health_check_timeout: introspection_timeout,
            ..RuntimeConfig::default()
        };

        let registry = RegistryConfig {
            stale_after: Duration::from_secs(nonzero("EMESH_STALE_AFTER_SECS", 300)),
            introspection_timeout,
            ..RegistryConfig::default()
        };

        let supervisor = SupervisorConfig {
            introspection_timeout,
            ..SupervisorConfig::default()
        };

        Ok(Self {
            node_id,
            cluster_size: nonzero("EMESH_CLUSTER_SIZE", 3) as usize,
            log_level,
            cleanup_interval: Duration::from_secs(nonzero("EMESH_CLEANUP_INTERVAL_SECS", 60)),
            default_strategy,
            runtime,
            registry,
            supervisor,
        })
    }
}
