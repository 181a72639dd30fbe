//! Processing-mode state machine.
//!
//! Each engine runtime embeds one [`ProcessingState`]. It turns request,
//! health and resource signals into a processing mode plus a list of
//! [`ModeAction`]s the runtime applies. The state machine performs no I/O;
//! time is always passed in.
//!
//! ## Modes
//!
//! - `idle`: nothing queued
//! - `real_time`: latency-sensitive traffic dominates
//! - `batch`: enough batchable work is queued to favour throughput
//! - `overloaded`: resource, error or latency thresholds exceeded
//! - `degraded`: the engine reports degraded health
//! - `recovery`: the engine reports unhealthy

mod machine;
mod metrics;
mod request;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use machine::{ModeHistory, ModeRecord, ModeSnapshot, ProcessingState};
pub use metrics::{Outcome, ProcessingMetrics};
pub use request::{Priority, RequestInfo, RequestQueue, RequestType};

/// The six processing modes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Idle,
    RealTime,
    Batch,
    Overloaded,
    Degraded,
    Recovery,
}

impl Mode {
    pub const ALL: [Mode; 6] = [
        Mode::Idle,
        Mode::RealTime,
        Mode::Batch,
        Mode::Overloaded,
        Mode::Degraded,
        Mode::Recovery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Idle => "idle",
            Mode::RealTime => "real_time",
            Mode::Batch => "batch",
            Mode::Overloaded => "overloaded",
            Mode::Degraded => "degraded",
            Mode::Recovery => "recovery",
        }
    }

    /// Modes entered without waiting out the cooldown.
    pub fn bypasses_cooldown(&self) -> bool {
        matches!(self, Mode::Overloaded | Mode::Degraded | Mode::Recovery)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ModeAction {
    SwitchMode { mode: Mode },
    /// Drop this percentage of queued requests, lowest priority first.
    ShedLoad { percent: u8 },
    IncreaseConcurrency { percent: u8 },
    DecreaseConcurrency { percent: u8 },
    Alert { mode: Mode, message: String },
}

/// Why a requested transition was not taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionRejection {
    AlreadyInMode,
    CooldownActive { remaining: Duration },
    NotBeneficial,
}

impl std::fmt::Display for TransitionRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionRejection::AlreadyInMode => f.write_str("already_in_mode"),
            TransitionRejection::CooldownActive { .. } => f.write_str("cooldown_active"),
            TransitionRejection::NotBeneficial => f.write_str("not_beneficial"),
        }
    }
}

/// Tunables for the state machine. Defaults reproduce the operational values
/// the thresholds were observed under.
#[derive(Debug, Clone)]
pub struct ModeConfig {
    pub queue_capacity: usize,
    pub history_capacity: usize,

    /// CPU and memory usage above this is overload.
    pub overload_threshold: f64,
    /// CPU usage below this allows leaving `overloaded`.
    pub recovery_threshold: f64,
    pub overload_error_rate: f64,
    pub overload_response_time: Duration,
    /// Queue fill fraction above which the engine counts as overloaded.
    pub overload_queue_fraction: f64,
    /// Error rate below which `overloaded`, `degraded` and `recovery` may be left.
    pub recovery_error_rate: f64,

    pub cooldown: Duration,
    pub ema_alpha: f64,
    pub effectiveness_floor: f64,

    /// Queue length above which batching is considered.
    pub batch_queue_trigger: usize,
    /// Batchable requests needed in the queue to prefer `batch`.
    pub batch_min_batchable: usize,
    pub realtime_to_batch_queue: usize,
    pub realtime_to_batch_latency: Duration,
    /// Largest queue that still lets `batch` hand over to `real_time`.
    pub batch_to_realtime_queue: usize,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            history_capacity: 50,
            overload_threshold: 0.8,
            recovery_threshold: 0.5,
            overload_error_rate: 0.1,
            overload_response_time: Duration::from_millis(200),
            overload_queue_fraction: 0.8,
            recovery_error_rate: 0.05,
            cooldown: Duration::from_secs(5),
            ema_alpha: 0.1,
            effectiveness_floor: 0.7,
            batch_queue_trigger: 5,
            batch_min_batchable: 3,
            realtime_to_batch_queue: 3,
            realtime_to_batch_latency: Duration::from_millis(50),
            batch_to_realtime_queue: 10,
        }
    }
}
