//! Exponential-moving-average processing metrics.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Result of one processed request, fed back into the metrics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Outcome {
    pub success: bool,
    pub response_time: Duration,
}

impl Outcome {
    pub fn success(response_time: Duration) -> Self {
        Self {
            success: true,
            response_time,
        }
    }

    pub fn failure(response_time: Duration) -> Self {
        Self {
            success: false,
            response_time,
        }
    }
}

/// Smoothed view of how the engine is coping.
///
/// Rates and usages stay within `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingMetrics {
    pub average_response_time_ms: f64,
    pub success_rate: f64,
    pub queue_depth: usize,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub error_rate: f64,
    /// Requests per second.
    pub throughput: f64,
}

impl Default for ProcessingMetrics {
    fn default() -> Self {
        Self {
            average_response_time_ms: 0.0,
            success_rate: 1.0,
            queue_depth: 0,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            error_rate: 0.0,
            throughput: 0.0,
        }
    }
}

impl ProcessingMetrics {
    pub fn average_response_time(&self) -> Duration {
        Duration::from_secs_f64(self.average_response_time_ms.max(0.0) / 1000.0)
    }

    /// Folds one outcome into the moving averages. `since_previous` is the
    /// gap to the previous outcome, if there was one.
    pub(crate) fn record(&mut self, outcome: &Outcome, alpha: f64, since_previous: Option<Duration>) {
        let alpha = alpha.clamp(0.0, 1.0);
        let sample_ms = outcome.response_time.as_secs_f64() * 1000.0;
        let (ok, failed) = if outcome.success { (1.0, 0.0) } else { (0.0, 1.0) };

        self.average_response_time_ms = ema(self.average_response_time_ms, sample_ms, alpha).max(0.0);
        self.success_rate = ema(self.success_rate, ok, alpha).clamp(0.0, 1.0);
        self.error_rate = ema(self.error_rate, failed, alpha).clamp(0.0, 1.0);

        if let Some(gap) = since_previous {
            // Cap the instantaneous rate so back-to-back outcomes do not explode it.
            let rate = 1.0 / gap.as_secs_f64().max(0.001);
            self.throughput = ema(self.throughput, rate, alpha).max(0.0);
        }
    }

    pub(crate) fn set_resource_usage(&mut self, cpu: f64, memory: f64) {
        self.cpu_usage = sanitize_fraction(cpu);
        self.memory_usage = sanitize_fraction(memory);
    }

    /// Weighted diagnostic score in `[0, 1]`.
    pub fn effectiveness(&self, queue_capacity: usize) -> f64 {
        let fill = self.queue_depth as f64 / queue_capacity.max(1) as f64;
        0.3 * response_time_score(self.average_response_time_ms)
            + 0.3 * success_rate_score(self.success_rate)
            + 0.2 * queue_score(fill)
            + 0.2 * error_score(self.error_rate)
    }
}

fn ema(current: f64, sample: f64, alpha: f64) -> f64 {
    alpha * sample + (1.0 - alpha) * current
}

fn sanitize_fraction(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn response_time_score(ms: f64) -> f64 {
    match ms {
        t if t < 50.0 => 1.0,
        t if t < 100.0 => 0.8,
        t if t < 200.0 => 0.5,
        _ => 0.2,
    }
}

fn success_rate_score(rate: f64) -> f64 {
    match rate {
        r if r >= 0.99 => 1.0,
        r if r >= 0.95 => 0.8,
        r if r >= 0.9 => 0.5,
        _ => 0.2,
    }
}

fn queue_score(fill: f64) -> f64 {
    match fill {
        f if f < 0.1 => 1.0,
        f if f < 0.5 => 0.7,
        f if f < 0.8 => 0.4,
        _ => 0.1,
    }
}

fn error_score(rate: f64) -> f64 {
    match rate {
        r if r < 0.01 => 1.0,
        r if r < 0.05 => 0.7,
        r if r < 0.1 => 0.4,
        _ => 0.1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[test]
    fn test_fresh_metrics_are_fully_effective() {
        let metrics = ProcessingMetrics::default();
        assert!((metrics.effectiveness(100) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_record_moves_averages_by_alpha() {
        let mut metrics = ProcessingMetrics::default();
        metrics.record(&Outcome::failure(Duration::from_millis(100)), 0.1, None);

        assert!((metrics.average_response_time_ms - 10.0).abs() < 1e-9);
        assert!((metrics.success_rate - 0.9).abs() < 1e-9);
        assert!((metrics.error_rate - 0.1).abs() < 1e-9);
        assert_eq!(metrics.throughput, 0.0);

        metrics.record(&Outcome::success(Duration::ZERO), 0.1, Some(Duration::from_millis(100)));
        assert!((metrics.throughput - 1.0).abs() < 1e-9);
    }

    #[rstest]
    #[case(10.0, 1.0)]
    #[case(75.0, 0.8)]
    #[case(150.0, 0.5)]
    #[case(500.0, 0.2)]
    fn test_response_time_steps(#[case] ms: f64, #[case] expected: f64) {
        assert_eq!(response_time_score(ms), expected);
    }

    #[rstest]
    #[case(0.995, 1.0)]
    #[case(0.96, 0.8)]
    #[case(0.91, 0.5)]
    #[case(0.5, 0.2)]
    fn test_success_rate_steps(#[case] rate: f64, #[case] expected: f64) {
        assert_eq!(success_rate_score(rate), expected);
    }

    #[test]
    fn test_degraded_metrics_are_ineffective() {
        let metrics = ProcessingMetrics {
            average_response_time_ms: 250.0,
            success_rate: 0.8,
            queue_depth: 90,
            error_rate: 0.2,
            ..ProcessingMetrics::default()
        };
        assert!(metrics.effectiveness(100) < 0.7);
    }

    #[test]
    fn test_resource_usage_is_clamped() {
        let mut metrics = ProcessingMetrics::default();
        metrics.set_resource_usage(1.7, f64::NAN);
        assert_eq!(metrics.cpu_usage, 1.0);
        assert_eq!(metrics.memory_usage, 0.0);
    }

    proptest! {
        #[test]
        fn prop_rates_stay_in_unit_interval(
            outcomes in proptest::collection::vec((any::<bool>(), 0u64..10_000), 1..200),
        ) {
            let mut metrics = ProcessingMetrics::default();
            for (success, ms) in outcomes {
                let outcome = Outcome { success, response_time: Duration::from_millis(ms) };
                metrics.record(&outcome, 0.1, Some(Duration::from_millis(ms)));
                prop_assert!((0.0..=1.0).contains(&metrics.success_rate));
                prop_assert!((0.0..=1.0).contains(&metrics.error_rate));
                prop_assert!(metrics.average_response_time_ms >= 0.0);
                prop_assert!((0.0..=1.0).contains(&metrics.effectiveness(100)));
            }
        }
    }
}
