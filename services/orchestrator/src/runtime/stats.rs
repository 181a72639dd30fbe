//! Per-mode request statistics kept by a runtime.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mode::Mode;

/// Counters for one processing path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModeStats {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    /// Always zero for batch.
    pub timeout: u64,
    /// Summed over successful calls only.
    pub sum_time_ms: f64,
    pub avg_time_ms: f64,
    pub min_time_ms: Option<f64>,
    pub max_time_ms: Option<f64>,
}

impl ModeStats {
    pub fn record_success(&mut self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.total += 1;
        self.success += 1;
        self.sum_time_ms += ms;
        self.avg_time_ms = self.sum_time_ms / self.success as f64;
        self.min_time_ms = Some(self.min_time_ms.map_or(ms, |m| m.min(ms)));
        self.max_time_ms = Some(self.max_time_ms.map_or(ms, |m| m.max(ms)));
    }

    pub fn record_failure(&mut self) {
        self.total += 1;
        self.failure += 1;
    }

    pub fn record_timeout(&mut self) {
        self.total += 1;
        self.timeout += 1;
    }

    /// Failed requests for load purposes: errors plus timeouts.
    pub fn failed(&self) -> u64 {
        self.failure + self.timeout
    }
}

/// Statistics a runtime reports to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeStats {
    pub real_time: ModeStats,
    pub batch: ModeStats,
    pub batch_items: u64,
    pub events_handled: u64,
    pub event_errors: u64,
    pub mode: Mode,
    pub concurrency_limit: u32,
    pub started_at: DateTime<Utc>,
}

impl RuntimeStats {
    pub fn new(concurrency_limit: u32) -> Self {
        Self {
            real_time: ModeStats::default(),
            batch: ModeStats::default(),
            batch_items: 0,
            events_handled: 0,
            event_errors: 0,
            mode: Mode::Idle,
            concurrency_limit,
            started_at: Utc::now(),
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.real_time.total + self.batch.total
    }
}

impl Default for RuntimeStats {
    fn default() -> Self {
        Self::new(0)
    }
}
