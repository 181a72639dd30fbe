//! The processing-mode state machine proper.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::metrics::{Outcome, ProcessingMetrics};
use super::request::{Priority, RequestInfo, RequestQueue, RequestType};
use super::{Mode, ModeAction, ModeConfig, TransitionRejection};
use crate::engine::Health;

/// One applied transition.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeRecord {
    pub from: Mode,
    pub to: Mode,
    pub at: Instant,
    pub reason: String,
}

/// Fixed-capacity transition history; the oldest record is dropped first.
#[derive(Debug, Clone)]
pub struct ModeHistory {
    records: VecDeque<ModeRecord>,
    capacity: usize,
}

impl ModeHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, record: ModeRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&ModeRecord> {
        self.records.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModeRecord> {
        self.records.iter()
    }
}

/// Point-in-time copy of a state machine for inspection.
#[derive(Debug, Clone)]
pub struct ModeSnapshot {
    pub mode: Mode,
    pub previous_mode: Option<Mode>,
    pub in_mode_for: Duration,
    pub transition_count: u64,
    pub queue_len: usize,
    pub health: Health,
    pub metrics: ProcessingMetrics,
    pub effectiveness: f64,
    pub ineffective_streak: u32,
    pub last_rejection: Option<TransitionRejection>,
    pub recent: Vec<ModeRecord>,
}

/// State machine instance owned by one engine runtime.
#[derive(Debug, Clone)]
pub struct ProcessingState {
    config: ModeConfig,
    current_mode: Mode,
    previous_mode: Option<Mode>,
    mode_started_at: Instant,
    last_transition_at: Option<Instant>,
    transition_count: u64,
    queue: RequestQueue,
    metrics: ProcessingMetrics,
    health: Health,
    history: ModeHistory,
    last_outcome_at: Option<Instant>,
    effectiveness: f64,
    ineffective_streak: u32,
    last_rejection: Option<TransitionRejection>,
}

impl ProcessingState {
    pub fn new(config: ModeConfig, now: Instant) -> Self {
        Self {
            queue: RequestQueue::new(config.queue_capacity),
            history: ModeHistory::new(config.history_capacity),
            config,
            current_mode: Mode::Idle,
            previous_mode: None,
            mode_started_at: now,
            last_transition_at: None,
            transition_count: 0,
            metrics: ProcessingMetrics::default(),
            health: Health::Healthy,
            last_outcome_at: None,
            effectiveness: 1.0,
            ineffective_streak: 0,
            last_rejection: None,
        }
    }

    pub fn mode(&self) -> Mode {
        self.current_mode
    }

    pub fn previous_mode(&self) -> Option<Mode> {
        self.previous_mode
    }

    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    pub fn metrics(&self) -> &ProcessingMetrics {
        &self.metrics
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn history(&self) -> &ModeHistory {
        &self.history
    }

    pub fn health(&self) -> Health {
        self.health
    }

    pub fn last_rejection(&self) -> Option<TransitionRejection> {
        self.last_rejection
    }

    pub fn snapshot(&self, now: Instant) -> ModeSnapshot {
        ModeSnapshot {
            mode: self.current_mode,
            previous_mode: self.previous_mode,
            in_mode_for: now.saturating_duration_since(self.mode_started_at),
            transition_count: self.transition_count,
            queue_len: self.queue.len(),
            health: self.health,
            metrics: self.metrics.clone(),
            effectiveness: self.effectiveness,
            ineffective_streak: self.ineffective_streak,
            last_rejection: self.last_rejection,
            recent: self.history.iter().cloned().collect(),
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Enqueues a request and moves to the mode it calls for, if allowed.
    pub fn handle_request(&mut self, request: RequestInfo, now: Instant) -> Vec<ModeAction> {
        let urgent_real_time =
            request.kind == RequestType::RealTime && request.priority == Priority::Urgent;
        let real_time = request.kind == RequestType::RealTime;

        if let Some(evicted) = self.queue.push(request) {
            debug!(request_id = %evicted.id, priority = ?evicted.priority, "Request evicted from full queue");
        }
        self.sync_queue_depth();
        self.evaluate_effectiveness();

        let target = self.target_mode(urgent_real_time, real_time);
        self.attempt(target, "request", now)
    }

    /// Records a processed request and consumes one queued entry.
    pub fn update_metrics(&mut self, outcome: &Outcome, now: Instant) {
        let since_previous = self
            .last_outcome_at
            .map(|at| now.saturating_duration_since(at));
        self.metrics
            .record(outcome, self.config.ema_alpha, since_previous);
        self.last_outcome_at = Some(now);
        self.queue.pop_front();
        self.sync_queue_depth();
    }

    /// Applies a health change. Health-driven transitions skip every gate.
    pub fn update_health(&mut self, health: Health, now: Instant) -> Vec<ModeAction> {
        let previous = self.health;
        self.health = health;

        let target = match (previous, health) {
            (Health::Healthy | Health::Unknown, Health::Degraded) => Some(Mode::Degraded),
            (Health::Healthy | Health::Unknown | Health::Degraded, Health::Unhealthy) => {
                Some(Mode::Recovery)
            }
            (Health::Unhealthy | Health::Degraded, Health::Healthy) => Some(Mode::Idle),
            _ => None,
        };

        match target {
            Some(mode) if mode != self.current_mode => {
                self.transition(mode, &format!("health {previous} -> {health}"), now)
            }
            _ => Vec::new(),
        }
    }

    /// Feeds resource usage (fractions of capacity) and enters or leaves
    /// `overloaded` accordingly.
    pub fn update_resource_usage(&mut self, cpu: f64, memory: f64, now: Instant) -> Vec<ModeAction> {
        self.metrics.set_resource_usage(cpu, memory);

        if self.health == Health::Unhealthy || self.health == Health::Degraded {
            return Vec::new();
        }
        if self.is_overloaded() {
            return self.attempt(Mode::Overloaded, "resource usage", now);
        }
        if self.current_mode == Mode::Overloaded {
            let target = if self.queue.is_empty() {
                Mode::Idle
            } else {
                Mode::RealTime
            };
            return self.attempt(target, "load relieved", now);
        }
        Vec::new()
    }

    /// Administrative override; skips every gate. Forcing the current mode
    /// is a no-op.
    pub fn force_transition(&mut self, mode: Mode, reason: &str, now: Instant) -> Vec<ModeAction> {
        if mode == self.current_mode {
            return Vec::new();
        }
        self.transition(mode, reason, now)
    }

    /// Drops `percent`% of the queue, lowest priority first.
    pub fn shed_load(&mut self, percent: u8) -> usize {
        let dropped = self.queue.shed(percent).len();
        self.sync_queue_depth();
        dropped
    }

    // =========================================================================
    // Decisions
    // =========================================================================

    pub fn is_overloaded(&self) -> bool {
        let m = &self.metrics;
        let queue_limit = self.config.overload_queue_fraction * self.queue.capacity() as f64;
        m.cpu_usage > self.config.overload_threshold
            || m.memory_usage > self.config.overload_threshold
            || m.error_rate > self.config.overload_error_rate
            || m.queue_depth as f64 > queue_limit
            || m.average_response_time() > self.config.overload_response_time
    }

    fn target_mode(&self, urgent_real_time: bool, real_time: bool) -> Mode {
        if self.health == Health::Unhealthy {
            Mode::Recovery
        } else if self.health == Health::Degraded {
            Mode::Degraded
        } else if self.is_overloaded() {
            Mode::Overloaded
        } else if urgent_real_time {
            Mode::RealTime
        } else if self.queue.len() > self.config.batch_queue_trigger
            && self.queue.batchable_count() >= self.config.batch_min_batchable
        {
            Mode::Batch
        } else if real_time {
            Mode::RealTime
        } else {
            Mode::Batch
        }
    }

    /// Gate for voluntary transitions.
    pub fn should_transition(&self, target: Mode, now: Instant) -> Result<(), TransitionRejection> {
        if target == self.current_mode {
            return Err(TransitionRejection::AlreadyInMode);
        }
        if target.bypasses_cooldown() {
            return Ok(());
        }
        if let Some(last) = self.last_transition_at {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.config.cooldown {
                return Err(TransitionRejection::CooldownActive {
                    remaining: self.config.cooldown - elapsed,
                });
            }
        }
        if self.is_beneficial(self.current_mode, target) {
            Ok(())
        } else {
            Err(TransitionRejection::NotBeneficial)
        }
    }

    fn is_beneficial(&self, from: Mode, to: Mode) -> bool {
        let m = &self.metrics;
        let avg = m.average_response_time();
        match (from, to) {
            (Mode::Overloaded, _) => {
                m.cpu_usage < self.config.recovery_threshold
                    && m.error_rate < self.config.recovery_error_rate
            }
            (Mode::Recovery | Mode::Degraded, _) => m.error_rate < self.config.recovery_error_rate,
            (_, Mode::Idle) => m.queue_depth == 0,
            (Mode::Idle, Mode::RealTime | Mode::Batch) => true,
            (Mode::RealTime, Mode::Batch) => {
                m.queue_depth > self.config.realtime_to_batch_queue
                    && avg > self.config.realtime_to_batch_latency
            }
            (Mode::Batch, Mode::RealTime) => m.queue_depth <= self.config.batch_to_realtime_queue,
            _ => true,
        }
    }

    fn attempt(&mut self, target: Mode, reason: &str, now: Instant) -> Vec<ModeAction> {
        match self.should_transition(target, now) {
            Ok(()) => {
                self.last_rejection = None;
                self.transition(target, reason, now)
            }
            Err(TransitionRejection::AlreadyInMode) => Vec::new(),
            Err(rejection) => {
                debug!(from = %self.current_mode, to = %target, rejection = %rejection, "Mode transition rejected");
                self.last_rejection = Some(rejection);
                Vec::new()
            }
        }
    }

    fn transition(&mut self, target: Mode, reason: &str, now: Instant) -> Vec<ModeAction> {
        let from = self.current_mode;
        self.history.push(ModeRecord {
            from,
            to: target,
            at: now,
            reason: reason.to_string(),
        });
        self.previous_mode = Some(from);
        self.current_mode = target;
        self.mode_started_at = now;
        self.last_transition_at = Some(now);
        self.transition_count += 1;

        let mut actions = vec![ModeAction::SwitchMode { mode: target }];
        match target {
            Mode::Overloaded => {
                actions.push(ModeAction::ShedLoad { percent: 20 });
                actions.push(alert(target, "engine overloaded, shedding load"));
            }
            Mode::Recovery => {
                actions.push(ModeAction::DecreaseConcurrency { percent: 50 });
                actions.push(alert(target, "engine unhealthy, entering recovery"));
            }
            Mode::Degraded => {
                actions.push(ModeAction::DecreaseConcurrency { percent: 25 });
                actions.push(alert(target, "engine degraded"));
            }
            Mode::Batch => actions.push(ModeAction::IncreaseConcurrency { percent: 10 }),
            Mode::RealTime => actions.push(ModeAction::DecreaseConcurrency { percent: 5 }),
            Mode::Idle => {}
        }
        actions
    }

    fn evaluate_effectiveness(&mut self) {
        self.effectiveness = self.metrics.effectiveness(self.queue.capacity());
        if self.effectiveness < self.config.effectiveness_floor {
            self.ineffective_streak += 1;
        } else {
            self.ineffective_streak = 0;
        }
    }

    fn sync_queue_depth(&mut self) {
        self.metrics.queue_depth = self.queue.len();
    }
}

fn alert(mode: Mode, message: &str) -> ModeAction {
    ModeAction::Alert {
        mode,
        message: message.to_string(),
    }
}
