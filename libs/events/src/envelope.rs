//! Telemetry event envelope - the common wrapper for all events.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use emesh_id::{EngineType, InstanceId, NodeId};
use serde::{Deserialize, Serialize};

use crate::{EventError, EventKind};

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

/// A single telemetry event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Process-wide monotonic event identifier.
    pub event_id: u64,

    /// What happened.
    pub kind: EventKind,

    /// When it happened.
    pub occurred_at: DateTime<Utc>,

    /// Node the subject engine lives on, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,

    /// Subject engine type, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_type: Option<EngineType>,

    /// Subject engine instance, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<InstanceId>,

    /// Numeric facts (durations, counts, scores).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub measurements: BTreeMap<String, f64>,

    /// Descriptive facts (reasons, mode names).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl TelemetryEvent {
    /// Starts building an event of the given kind.
    pub fn builder(kind: EventKind) -> TelemetryEventBuilder {
        TelemetryEventBuilder::new(kind)
    }

    /// Returns a measurement by name.
    pub fn measurement(&self, name: &str) -> Option<f64> {
        self.measurements.get(name).copied()
    }

    /// Returns a string metadata entry by name.
    pub fn meta_str(&self, name: &str) -> Result<Option<&str>, EventError> {
        match self.metadata.get(name) {
            None => Ok(None),
            Some(serde_json::Value::String(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(EventError::InvalidPayload(format!(
                "metadata '{name}' is not a string: {other}"
            ))),
        }
    }

    /// Serializes the event as a single JSON line.
    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Builder for constructing telemetry events.
#[derive(Debug)]
pub struct TelemetryEventBuilder {
    kind: EventKind,
    occurred_at: Option<DateTime<Utc>>,
    node_id: Option<NodeId>,
    engine_type: Option<EngineType>,
    instance_id: Option<InstanceId>,
    measurements: BTreeMap<String, f64>,
    metadata: serde_json::Map<String, serde_json::Value>,
}

impl TelemetryEventBuilder {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            occurred_at: None,
            node_id: None,
            engine_type: None,
            instance_id: None,
            measurements: BTreeMap::new(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn occurred_at(mut self, ts: DateTime<Utc>) -> Self {
        self.occurred_at = Some(ts);
        self
    }

    pub fn node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn engine(mut self, engine_type: &EngineType, instance_id: &InstanceId) -> Self {
        self.engine_type = Some(engine_type.clone());
        self.instance_id = Some(instance_id.clone());
        self
    }

    pub fn measure(mut self, name: impl Into<String>, value: f64) -> Self {
        self.measurements.insert(name.into(), value);
        self
    }

    pub fn meta(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(name.into(), value.into());
        self
    }

    /// Builds the event, assigning the next event ID.
    pub fn build(self) -> TelemetryEvent {
        TelemetryEvent {
            event_id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed),
            kind: self.kind,
            occurred_at: self.occurred_at.unwrap_or_else(Utc::now),
            node_id: self.node_id,
            engine_type: self.engine_type,
            instance_id: self.instance_id,
            measurements: self.measurements,
            metadata: self.metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder() {
        let engine_type = EngineType::new("code_analysis").unwrap();
        let instance_id = InstanceId::derive_at(&engine_type, &serde_json::json!({}), 42);
        let node = NodeId::new();

        let event = TelemetryEvent::builder(EventKind::EngineRegistered)
            .node(node)
            .engine(&engine_type, &instance_id)
            .measure("capabilities", 2.0)
            .meta("health", "healthy")
            .build();

        assert_eq!(event.kind, EventKind::EngineRegistered);
        assert_eq!(event.node_id, Some(node));
        assert_eq!(event.instance_id.as_ref(), Some(&instance_id));
        assert_eq!(event.measurement("capabilities"), Some(2.0));
        assert_eq!(event.meta_str("health").unwrap(), Some("healthy"));
    }

    #[test]
    fn test_event_ids_are_monotonic() {
        let first = TelemetryEvent::builder(EventKind::RegistryCleanup).build();
        let second = TelemetryEvent::builder(EventKind::RegistryCleanup).build();
        assert!(second.event_id > first.event_id);
    }

    #[test]
    fn test_meta_str_rejects_non_strings() {
        let event = TelemetryEvent::builder(EventKind::EngineAlert)
            .meta("level", 3)
            .build();
        assert!(matches!(
            event.meta_str("level"),
            Err(EventError::InvalidPayload(_))
        ));
        assert_eq!(event.meta_str("missing").unwrap(), None);
    }

    #[test]
    fn test_event_json_roundtrip() {
        let event = TelemetryEvent::builder(EventKind::RegistryCleanup)
            .measure("removed", 3.0)
            .build();
        let json = event.to_json().unwrap();
        assert!(json.contains("\"kind\":\"registry.cleanup\""));
        let parsed: TelemetryEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
