//! Configurable mock engine for development and tests.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use emesh_events::ExitReason;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{Capabilities, Engine, EngineConfig, EngineError, Health};

/// Shared switches for steering a running [`MockEngine`] from outside.
///
/// Cloning yields another view onto the same switches, so a test can keep
/// one while the engine (and every restart of it) holds another.
#[derive(Debug, Clone, Default)]
pub struct MockControls {
    inner: Arc<ControlsInner>,
}

#[derive(Debug, Default)]
struct ControlsInner {
    delay_ms: AtomicU64,
    failing: AtomicBool,
    panic_next: AtomicBool,
    health: AtomicU8,
    inits: AtomicU64,
    terminations: AtomicU64,
}

impl MockControls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay applied to every processing call.
    pub fn set_delay(&self, delay: Duration) {
        self.inner
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Makes processing calls report an engine error.
    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    /// Makes the next engine callback panic, whichever it is.
    pub fn panic_next(&self) {
        self.inner.panic_next.store(true, Ordering::SeqCst);
    }

    fn take_panic(&self) -> bool {
        self.inner.panic_next.swap(false, Ordering::SeqCst)
    }

    /// Health reported by the next health checks.
    pub fn set_health(&self, health: Health) {
        self.inner.health.store(encode_health(health), Ordering::SeqCst);
    }

    /// Number of successful `init` calls across all engines sharing these controls.
    pub fn inits(&self) -> u64 {
        self.inner.inits.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> u64 {
        self.inner.terminations.load(Ordering::SeqCst)
    }

    fn delay(&self) -> Duration {
        Duration::from_millis(self.inner.delay_ms.load(Ordering::SeqCst))
    }

    fn health(&self) -> Health {
        decode_health(self.inner.health.load(Ordering::SeqCst))
    }
}

// Zero decodes to Healthy so fresh controls start healthy.
fn encode_health(health: Health) -> u8 {
    match health {
        Health::Healthy => 0,
        Health::Degraded => 1,
        Health::Unhealthy => 2,
        Health::Unknown => 3,
    }
}

fn decode_health(raw: u8) -> Health {
    match raw {
        0 => Health::Healthy,
        1 => Health::Degraded,
        2 => Health::Unhealthy,
        _ => Health::Unknown,
    }
}

/// State threaded through the mock engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MockState {
    pub config: Value,
    pub processed: u64,
    pub failed: u64,
    pub events: u64,
}

/// Mock engine that echoes its input.
#[derive(Debug, Clone)]
pub struct MockEngine {
    capabilities: Capabilities,
    fail_init: bool,
    controls: MockControls,
}

impl MockEngine {
    /// Create a mock engine advertising the given capabilities.
    pub fn new(capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            fail_init: false,
            controls: MockControls::new(),
        }
    }

    /// Create a mock engine whose `init` always fails.
    pub fn failing_init(capabilities: Capabilities) -> Self {
        Self {
            fail_init: true,
            ..Self::new(capabilities)
        }
    }

    pub fn with_controls(mut self, controls: MockControls) -> Self {
        self.controls = controls;
        self
    }

    pub fn controls(&self) -> MockControls {
        self.controls.clone()
    }

    async fn simulate_work(&self) -> Result<(), EngineError> {
        let delay = self.controls.delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.controls.take_panic() {
            panic!("mock engine panic");
        }
        if self.controls.inner.failing.load(Ordering::SeqCst) {
            return Err(EngineError::Failed("mock engine configured to fail".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Engine for MockEngine {
    type State = MockState;

    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    async fn init(&self, config: &EngineConfig) -> Result<MockState, EngineError> {
        if self.controls.take_panic() {
            panic!("mock engine panic in init");
        }
        if self.fail_init {
            return Err(EngineError::Failed("mock engine configured to fail init".into()));
        }
        self.controls.inner.inits.fetch_add(1, Ordering::SeqCst);
        info!(capabilities = ?self.capabilities, "[MOCK] Engine initialized");
        Ok(MockState {
            config: config.clone(),
            ..MockState::default()
        })
    }

    async fn process_real_time(
        &self,
        data: Value,
        mut state: MockState,
    ) -> (Result<Value, EngineError>, MockState) {
        match self.simulate_work().await {
            Ok(()) => {
                state.processed += 1;
                let output = json!({ "echo": data, "processed": state.processed });
                (Ok(output), state)
            }
            Err(e) => {
                state.failed += 1;
                (Err(e), state)
            }
        }
    }

    async fn process_batch(
        &self,
        items: Vec<Value>,
        mut state: MockState,
    ) -> (Result<Vec<Value>, EngineError>, MockState) {
        match self.simulate_work().await {
            Ok(()) => {
                state.processed += items.len() as u64;
                let outputs = items.into_iter().map(|item| json!({ "echo": item })).collect();
                (Ok(outputs), state)
            }
            Err(e) => {
                state.failed += 1;
                (Err(e), state)
            }
        }
    }

    async fn health_check(&self, _state: &MockState) -> Health {
        if self.controls.take_panic() {
            panic!("mock engine panic in health check");
        }
        self.controls.health()
    }

    async fn handle_event(&self, event: Value, state: &mut MockState) -> Result<(), EngineError> {
        if self.controls.take_panic() {
            panic!("mock engine panic in event handler");
        }
        if event.get("fail").and_then(Value::as_bool).unwrap_or(false) {
            return Err(EngineError::Failed("mock engine rejected event".into()));
        }
        state.events += 1;
        debug!(events = state.events, "[MOCK] Event handled");
        Ok(())
    }

    async fn terminate(&self, reason: ExitReason, state: MockState) {
        self.controls.inner.terminations.fetch_add(1, Ordering::SeqCst);
        if self.controls.take_panic() {
            panic!("mock engine panic in terminate");
        }
        info!(reason = %reason, processed = state.processed, "[MOCK] Engine terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::capabilities;

    #[tokio::test]
    async fn test_mock_echoes_and_counts() {
        let engine = MockEngine::new(capabilities(["echo"]));
        let state = engine.init(&json!({"k": 1})).await.unwrap();
        assert_eq!(state.config, json!({"k": 1}));

        let (result, state) = engine.process_real_time(json!("hi"), state).await;
        assert_eq!(result.unwrap(), json!({"echo": "hi", "processed": 1}));

        let (result, state) = engine
            .process_batch(vec![json!(1), json!(2)], state)
            .await;
        assert_eq!(result.unwrap().len(), 2);
        assert_eq!(state.processed, 3);
    }

    #[tokio::test]
    async fn test_mock_failure_still_returns_state() {
        let engine = MockEngine::new(capabilities(["echo"]));
        let controls = engine.controls();
        let state = engine.init(&Value::Null).await.unwrap();

        controls.set_failing(true);
        let (result, state) = engine.process_real_time(json!(1), state).await;
        assert!(matches!(result, Err(EngineError::Failed(_))));
        assert_eq!(state.failed, 1);
    }

    #[tokio::test]
    async fn test_mock_failing_init() {
        let engine = MockEngine::failing_init(capabilities(["echo"]));
        assert!(engine.init(&Value::Null).await.is_err());
        assert_eq!(engine.controls().inits(), 0);
    }

    #[tokio::test]
    async fn test_mock_health_script() {
        let engine = MockEngine::new(capabilities(["echo"]));
        let controls = engine.controls();
        let state = engine.init(&Value::Null).await.unwrap();

        assert_eq!(engine.health_check(&state).await, Health::Healthy);
        controls.set_health(Health::Degraded);
        assert_eq!(engine.health_check(&state).await, Health::Degraded);
    }

    #[tokio::test]
    async fn test_mock_event_errors() {
        let engine = MockEngine::new(capabilities(["echo"]));
        let mut state = engine.init(&Value::Null).await.unwrap();

        engine.handle_event(json!({"ping": true}), &mut state).await.unwrap();
        assert!(engine.handle_event(json!({"fail": true}), &mut state).await.is_err());
        assert_eq!(state.events, 1);
    }
}
