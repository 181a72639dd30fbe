//! Engine catalog: engine implementations known at composition time.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use emesh_id::EngineType;

use crate::engine::Engine;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::runtime::{spawn_runtime, LaunchedRuntime, RuntimeContext};

/// Starts runtimes for one engine type.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn launch(&self, ctx: RuntimeContext) -> OrchestratorResult<LaunchedRuntime>;
}

/// Any `Fn() -> Engine` is a factory: each launch builds a fresh engine.
#[async_trait]
impl<F, E> EngineFactory for F
where
    F: Fn() -> E + Send + Sync,
    E: Engine,
{
    async fn launch(&self, ctx: RuntimeContext) -> OrchestratorResult<LaunchedRuntime> {
        spawn_runtime(self(), ctx).await
    }
}

/// Engine types and their factories.
#[derive(Clone, Default)]
pub struct EngineCatalog {
    factories: BTreeMap<EngineType, Arc<dyn EngineFactory>>,
}

impl EngineCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the factory for `engine_type`.
    pub fn register(mut self, engine_type: EngineType, factory: impl EngineFactory + 'static) -> Self {
        self.factories.insert(engine_type, Arc::new(factory));
        self
    }

    pub fn get(&self, engine_type: &EngineType) -> OrchestratorResult<Arc<dyn EngineFactory>> {
        self.factories
            .get(engine_type)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found(format!("engine type {engine_type}")))
    }

    pub fn contains(&self, engine_type: &EngineType) -> bool {
        self.factories.contains_key(engine_type)
    }

    pub fn engine_types(&self) -> impl Iterator<Item = &EngineType> {
        self.factories.keys()
    }
}

impl std::fmt::Debug for EngineCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{capabilities, MockEngine};

    #[test]
    fn test_lookup() {
        let analyzer = EngineType::new("analyzer").unwrap();
        let catalog =
            EngineCatalog::new().register(analyzer.clone(), || MockEngine::new(capabilities(["x"])));

        assert!(catalog.contains(&analyzer));
        assert!(catalog.get(&analyzer).is_ok());
        assert_eq!(catalog.engine_types().count(), 1);

        let missing = EngineType::new("missing").unwrap();
        assert!(matches!(
            catalog.get(&missing),
            Err(OrchestratorError::NotFound(_))
        ));
    }
}
