//! Selection strategies and criteria.

use std::sync::Arc;

use emesh_id::NodeId;
use serde::{Deserialize, Serialize};

use super::descriptor::EngineDescriptor;
use crate::engine::{Capabilities, Health};
use crate::error::OrchestratorError;

/// Policy for picking one engine among matching candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    RoundRobin,
    #[default]
    LeastLoaded,
    HealthWeighted,
    CapabilityMatch,
}

impl SelectionStrategy {
    pub const ALL: [SelectionStrategy; 4] = [
        SelectionStrategy::RoundRobin,
        SelectionStrategy::LeastLoaded,
        SelectionStrategy::HealthWeighted,
        SelectionStrategy::CapabilityMatch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionStrategy::RoundRobin => "round_robin",
            SelectionStrategy::LeastLoaded => "least_loaded",
            SelectionStrategy::HealthWeighted => "health_weighted",
            SelectionStrategy::CapabilityMatch => "capability_match",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            SelectionStrategy::RoundRobin => 0,
            SelectionStrategy::LeastLoaded => 1,
            SelectionStrategy::HealthWeighted => 2,
            SelectionStrategy::CapabilityMatch => 3,
        }
    }
}

impl std::fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SelectionStrategy {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SelectionStrategy::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| OrchestratorError::UnknownStrategy(s.to_string()))
    }
}

/// Candidate filters for capability lookups.
#[derive(Debug, Clone)]
pub struct FindOptions {
    /// Only healthy and degraded engines pass when set.
    pub exclude_unhealthy: bool,
    pub preferred_node: Option<NodeId>,
    pub max_load: f64,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            exclude_unhealthy: true,
            preferred_node: None,
            max_load: 1.0,
        }
    }
}

impl FindOptions {
    pub(crate) fn admits(&self, descriptor: &EngineDescriptor) -> bool {
        (!self.exclude_unhealthy || descriptor.health.is_serving())
            && self.preferred_node.map_or(true, |n| n == descriptor.node)
            && descriptor.load_score() <= self.max_load
    }
}

/// A `get_best` query.
#[derive(Debug, Clone)]
pub struct SelectionCriteria {
    pub capabilities: Capabilities,
    pub strategy: SelectionStrategy,
    pub exclude_unhealthy: bool,
    pub preferred_node: Option<NodeId>,
    pub max_load: f64,
}

impl SelectionCriteria {
    pub fn new(capabilities: Capabilities) -> Self {
        let defaults = FindOptions::default();
        Self {
            capabilities,
            strategy: SelectionStrategy::default(),
            exclude_unhealthy: defaults.exclude_unhealthy,
            preferred_node: defaults.preferred_node,
            max_load: defaults.max_load,
        }
    }

    pub fn strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn preferred_node(mut self, node: NodeId) -> Self {
        self.preferred_node = Some(node);
        self
    }

    pub fn max_load(mut self, max_load: f64) -> Self {
        self.max_load = max_load;
        self
    }

    pub fn include_unhealthy(mut self) -> Self {
        self.exclude_unhealthy = false;
        self
    }

    pub fn find_options(&self) -> FindOptions {
        FindOptions {
            exclude_unhealthy: self.exclude_unhealthy,
            preferred_node: self.preferred_node,
            max_load: self.max_load,
        }
    }
}

/// Applies `strategy` to a non-empty, stably ordered candidate list.
///
/// `next_round_robin` yields the round-robin counter value and advances it;
/// it is only called for `RoundRobin`.
pub(crate) fn select(
    strategy: SelectionStrategy,
    candidates: &[Arc<EngineDescriptor>],
    required: &Capabilities,
    next_round_robin: impl FnOnce() -> u64,
) -> Option<Arc<EngineDescriptor>> {
    if candidates.is_empty() {
        return None;
    }
    match strategy {
        SelectionStrategy::RoundRobin => {
            let index = (next_round_robin() % candidates.len() as u64) as usize;
            candidates.get(index).cloned()
        }
        SelectionStrategy::LeastLoaded => least_loaded(candidates.iter()),
        SelectionStrategy::HealthWeighted => {
            least_loaded(candidates.iter().filter(|d| d.health == Health::Healthy)).or_else(|| {
                candidates
                    .iter()
                    .find(|d| d.health == Health::Degraded)
                    .cloned()
            })
        }
        SelectionStrategy::CapabilityMatch => {
            let mut best: Option<(&Arc<EngineDescriptor>, f64)> = None;
            for candidate in candidates {
                let score = match_score(candidate, required);
                let better = match best {
                    None => true,
                    Some((current, best_score)) => {
                        score > best_score
                            || (score == best_score && candidate.load_score() < current.load_score())
                    }
                };
                if better {
                    best = Some((candidate, score));
                }
            }
            best.map(|(d, _)| Arc::clone(d))
        }
    }
}

/// Fraction of the required capabilities the engine provides.
fn match_score(descriptor: &EngineDescriptor, required: &Capabilities) -> f64 {
    if required.is_empty() {
        return 1.0;
    }
    let overlap = required.intersection(&descriptor.capabilities).count();
    overlap as f64 / required.len() as f64
}

fn least_loaded<'a>(
    candidates: impl Iterator<Item = &'a Arc<EngineDescriptor>>,
) -> Option<Arc<EngineDescriptor>> {
    // min_by keeps the first of equal minima.
    candidates
        .min_by(|a, b| a.load_score().total_cmp(&b.load_score()))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("round_robin", SelectionStrategy::RoundRobin)]
    #[case("least_loaded", SelectionStrategy::LeastLoaded)]
    #[case("health_weighted", SelectionStrategy::HealthWeighted)]
    #[case("capability_match", SelectionStrategy::CapabilityMatch)]
    fn test_strategy_parse(#[case] name: &str, #[case] expected: SelectionStrategy) {
        assert_eq!(name.parse::<SelectionStrategy>().unwrap(), expected);
        assert_eq!(expected.to_string(), name);
    }

    #[test]
    fn test_unknown_strategy() {
        let err = "random".parse::<SelectionStrategy>().unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownStrategy(s) if s == "random"));
    }

    #[test]
    fn test_strategy_indices_are_distinct() {
        let mut seen = [false; 4];
        for strategy in SelectionStrategy::ALL {
            assert!(!seen[strategy.index()]);
            seen[strategy.index()] = true;
        }
    }

    #[test]
    fn test_criteria_defaults() {
        let criteria = SelectionCriteria::new(Capabilities::new());
        assert_eq!(criteria.strategy, SelectionStrategy::LeastLoaded);
        assert!(criteria.exclude_unhealthy);
        assert_eq!(criteria.max_load, 1.0);
        assert!(!criteria.include_unhealthy().find_options().exclude_unhealthy);
    }
}
