//! Engine descriptors held by the registry.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use emesh_id::{EngineType, InstanceId, NodeId};
use serde::Serialize;

use super::load::{load_score, LoadWeights};
use crate::engine::{Capabilities, Health};
use crate::runtime::{RuntimeHandle, RuntimeStats};

/// Registry key: one entry per engine instance.
pub type RegistryKey = (EngineType, InstanceId);

/// Directory entry for one running engine instance.
///
/// Descriptors are immutable once published; updates replace them whole.
#[derive(Debug, Clone)]
pub struct EngineDescriptor {
    pub engine_type: EngineType,
    pub instance_id: InstanceId,
    pub process: RuntimeHandle,
    pub node: NodeId,
    pub capabilities: Capabilities,
    pub health: Health,
    pub statistics: RuntimeStats,
    pub last_seen: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
    load_score: f64,
}

impl EngineDescriptor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        engine_type: EngineType,
        instance_id: InstanceId,
        process: RuntimeHandle,
        capabilities: Capabilities,
        health: Health,
        statistics: RuntimeStats,
        metadata: BTreeMap<String, String>,
        weights: &LoadWeights,
    ) -> Self {
        Self {
            load_score: load_score(&statistics, weights),
            node: process.node(),
            engine_type,
            instance_id,
            process,
            capabilities,
            health,
            statistics,
            last_seen: Utc::now(),
            metadata,
        }
    }

    /// Copy with refreshed health and statistics; the load score is recomputed.
    pub(crate) fn with_status(&self, health: Health, statistics: RuntimeStats, weights: &LoadWeights) -> Self {
        Self {
            health,
            load_score: load_score(&statistics, weights),
            statistics,
            last_seen: Utc::now(),
            ..self.clone()
        }
    }

    /// Load in `[0, 1]`, derived from the statistics.
    pub fn load_score(&self) -> f64 {
        self.load_score
    }

    pub fn key(&self) -> RegistryKey {
        (self.engine_type.clone(), self.instance_id.clone())
    }

    /// True if this engine has every required capability.
    pub fn provides(&self, required: &Capabilities) -> bool {
        required.is_subset(&self.capabilities)
    }

    pub fn is_alive(&self) -> bool {
        self.process.is_alive()
    }

    pub fn info(&self) -> EngineInfo {
        EngineInfo {
            engine_type: self.engine_type.clone(),
            instance_id: self.instance_id.clone(),
            node: self.node,
            capabilities: self.capabilities.clone(),
            health: self.health,
            statistics: self.statistics.clone(),
            load_score: self.load_score,
            last_seen: self.last_seen,
            metadata: self.metadata.clone(),
        }
    }
}

/// Serializable view of an engine instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineInfo {
    pub engine_type: EngineType,
    pub instance_id: InstanceId,
    pub node: NodeId,
    pub capabilities: Capabilities,
    pub health: Health,
    pub statistics: RuntimeStats,
    pub load_score: f64,
    pub last_seen: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
}

/// Filter for listing engines. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct EngineFilter {
    pub engine_type: Option<EngineType>,
    pub node: Option<NodeId>,
    pub health: Option<Health>,
}

impl EngineFilter {
    pub fn engine_type(engine_type: EngineType) -> Self {
        Self {
            engine_type: Some(engine_type),
            ..Self::default()
        }
    }

    pub fn node(mut self, node: NodeId) -> Self {
        self.node = Some(node);
        self
    }

    pub fn health(mut self, health: Health) -> Self {
        self.health = Some(health);
        self
    }

    pub fn matches(&self, descriptor: &EngineDescriptor) -> bool {
        self.engine_type
            .as_ref()
            .map_or(true, |t| *t == descriptor.engine_type)
            && self.node.map_or(true, |n| n == descriptor.node)
            && self.health.map_or(true, |h| h == descriptor.health)
    }
}
