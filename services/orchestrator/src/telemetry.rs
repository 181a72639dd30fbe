//! Telemetry sinks.
//!
//! Components emit [`TelemetryEvent`]s fire-and-forget; a sink decides where
//! they go.

use std::sync::Mutex;

use emesh_events::{EventKind, TelemetryEvent};
use tracing::info;

/// Destination for telemetry events. Emitting never fails.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, event: TelemetryEvent) {
        info!(
            event_id = event.event_id,
            event = %event.kind,
            node_id = ?event.node_id,
            engine_type = ?event.engine_type,
            instance_id = ?event.instance_id,
            measurements = ?event.measurements,
            metadata = %serde_json::Value::Object(event.metadata.clone()),
            "telemetry"
        );
    }
}

/// Keeps events in memory for tests and inspection.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.lock().clone()
    }

    pub fn of_kind(&self, kind: EventKind) -> Vec<TelemetryEvent> {
        self.lock()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.lock().iter().filter(|e| e.kind == kind).count()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<TelemetryEvent>> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl TelemetrySink for MemorySink {
    fn emit(&self, event: TelemetryEvent) {
        self.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_filters_by_kind() {
        let sink = MemorySink::new();
        sink.emit(TelemetryEvent::builder(EventKind::EngineStarted).build());
        sink.emit(TelemetryEvent::builder(EventKind::EngineDown).build());
        sink.emit(TelemetryEvent::builder(EventKind::EngineStarted).build());

        assert_eq!(sink.events().len(), 3);
        assert_eq!(sink.count(EventKind::EngineStarted), 2);
        assert_eq!(sink.of_kind(EventKind::EngineDown).len(), 1);

        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_tracing_sink_accepts_events() {
        TracingSink.emit(
            TelemetryEvent::builder(EventKind::RegistryCleanup)
                .measure("removed", 1.0)
                .build(),
        );
    }
}
