//! Cluster membership providers.

use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock};

use emesh_id::NodeId;
use tracing::info;

/// Source of the cluster's member list.
pub trait Membership: Send + Sync {
    /// Every known member, live or not.
    fn members(&self) -> Vec<NodeId>;

    /// Members currently able to host engines.
    fn live_members(&self) -> Vec<NodeId>;
}

/// Fixed member list with per-node up/down switches.
#[derive(Debug)]
pub struct StaticMembership {
    nodes: Vec<NodeId>,
    down: RwLock<BTreeSet<NodeId>>,
}

impl StaticMembership {
    pub fn new(nodes: Vec<NodeId>) -> Self {
        Self {
            nodes,
            down: RwLock::new(BTreeSet::new()),
        }
    }

    /// `size` freshly generated members.
    pub fn with_size(size: usize) -> Self {
        Self::new((0..size).map(|_| NodeId::new()).collect())
    }

    pub fn set_down(&self, node: NodeId) {
        if self.down.write().unwrap_or_else(PoisonError::into_inner).insert(node) {
            info!(node_id = %node, "Member marked down");
        }
    }

    pub fn set_up(&self, node: NodeId) {
        if self.down.write().unwrap_or_else(PoisonError::into_inner).remove(&node) {
            info!(node_id = %node, "Member marked up");
        }
    }
}

impl Membership for StaticMembership {
    fn members(&self) -> Vec<NodeId> {
        self.nodes.clone()
    }

    fn live_members(&self) -> Vec<NodeId> {
        let down = self.down.read().unwrap_or_else(PoisonError::into_inner);
        self.nodes
            .iter()
            .filter(|n| !down.contains(n))
            .copied()
            .collect()
    }
}
