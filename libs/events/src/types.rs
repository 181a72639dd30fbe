//! Event kinds and shared vocabulary for telemetry events.

use serde::{Deserialize, Serialize};

use crate::EventError;

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    // Supervisor lifecycle
    pub const ENGINE_STARTED: &str = "engine.started";
    pub const ENGINE_STOPPED: &str = "engine.stopped";
    pub const ENGINE_RESTARTED: &str = "engine.restarted";

    // Registry membership
    pub const ENGINE_REGISTERED: &str = "engine.registered";
    pub const ENGINE_DEREGISTERED: &str = "engine.deregistered";
    pub const ENGINE_DOWN: &str = "engine.down";

    // Runtime state
    pub const ENGINE_HEALTH_CHANGED: &str = "engine.health_changed";
    pub const ENGINE_MODE_CHANGED: &str = "engine.mode_changed";
    pub const ENGINE_ALERT: &str = "engine.alert";

    // Registry maintenance
    pub const REGISTRY_CLEANUP: &str = "registry.cleanup";
}

// =============================================================================
// Event Kind
// =============================================================================

/// Typed form of the event names in [`event_types`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    EngineStarted,
    EngineStopped,
    EngineRestarted,
    EngineRegistered,
    EngineDeregistered,
    EngineDown,
    EngineHealthChanged,
    EngineModeChanged,
    EngineAlert,
    RegistryCleanup,
}

impl EventKind {
    /// Every event kind, in catalogue order.
    pub const ALL: [EventKind; 10] = [
        EventKind::EngineStarted,
        EventKind::EngineStopped,
        EventKind::EngineRestarted,
        EventKind::EngineRegistered,
        EventKind::EngineDeregistered,
        EventKind::EngineDown,
        EventKind::EngineHealthChanged,
        EventKind::EngineModeChanged,
        EventKind::EngineAlert,
        EventKind::RegistryCleanup,
    ];

    /// Returns the dotted event name.
    pub const fn as_str(self) -> &'static str {
        use event_types::*;
        match self {
            EventKind::EngineStarted => ENGINE_STARTED,
            EventKind::EngineStopped => ENGINE_STOPPED,
            EventKind::EngineRestarted => ENGINE_RESTARTED,
            EventKind::EngineRegistered => ENGINE_REGISTERED,
            EventKind::EngineDeregistered => ENGINE_DEREGISTERED,
            EventKind::EngineDown => ENGINE_DOWN,
            EventKind::EngineHealthChanged => ENGINE_HEALTH_CHANGED,
            EventKind::EngineModeChanged => ENGINE_MODE_CHANGED,
            EventKind::EngineAlert => ENGINE_ALERT,
            EventKind::RegistryCleanup => REGISTRY_CLEANUP,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| EventError::UnknownEventType(s.to_string()))
    }
}

impl Serialize for EventKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Shared Enums
// =============================================================================

/// Why an engine process exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// The runtime stopped on request (stop, restart, ensure).
    Normal,
    /// The node or cluster is shutting down.
    Shutdown,
    /// The process was killed from outside.
    Killed,
    /// The runtime failed (init failure, panic, permanent actor error).
    Crashed,
}

impl ExitReason {
    /// Returns true for exits a transient restart policy should react to.
    pub fn is_abnormal(&self) -> bool {
        matches!(self, ExitReason::Killed | ExitReason::Crashed)
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitReason::Normal => "normal",
            ExitReason::Shutdown => "shutdown",
            ExitReason::Killed => "killed",
            ExitReason::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_roundtrip() {
        for kind in EventKind::ALL {
            let parsed: EventKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_event_kind_unknown() {
        let err = "engine.exploded".parse::<EventKind>().unwrap_err();
        assert_eq!(err, EventError::UnknownEventType("engine.exploded".into()));
    }

    #[test]
    fn test_event_kind_serialization() {
        assert_eq!(
            serde_json::to_string(&EventKind::RegistryCleanup).unwrap(),
            "\"registry.cleanup\""
        );
    }

    #[test]
    fn test_exit_reason_abnormal() {
        assert!(ExitReason::Killed.is_abnormal());
        assert!(ExitReason::Crashed.is_abnormal());
        assert!(!ExitReason::Normal.is_abnormal());
        assert!(!ExitReason::Shutdown.is_abnormal());
    }
}
