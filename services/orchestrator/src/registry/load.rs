//! Load score computation.

use crate::runtime::{ModeStats, RuntimeStats};

/// Weights and normalisers for the load score.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadWeights {
    pub real_time: f64,
    pub batch: f64,
    /// Request count at which the volume factor saturates.
    pub request_normalizer: f64,
    /// Average latency (ms) at which the latency factor saturates.
    pub latency_normalizer_ms: f64,
}

impl Default for LoadWeights {
    fn default() -> Self {
        Self {
            real_time: 0.7,
            batch: 0.3,
            request_normalizer: 100.0,
            latency_normalizer_ms: 100.0,
        }
    }
}

/// Load of one processing path: the mean of volume, failure ratio and
/// latency, each normalised to `[0, 1]`.
pub fn mode_load(stats: &ModeStats, weights: &LoadWeights) -> f64 {
    let total = stats.total as f64;
    let volume = unit(total / weights.request_normalizer.max(1.0));
    let failure = if stats.total == 0 {
        0.0
    } else {
        unit(stats.failed() as f64 / total)
    };
    let latency = unit(stats.avg_time_ms / weights.latency_normalizer_ms.max(f64::EPSILON));
    (volume + failure + latency) / 3.0
}

/// Composite load score in `[0, 1]`.
pub fn load_score(stats: &RuntimeStats, weights: &LoadWeights) -> f64 {
    unit(
        unit(weights.real_time) * mode_load(&stats.real_time, weights)
            + unit(weights.batch) * mode_load(&stats.batch, weights),
    )
}

fn unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_idle_engine_has_zero_load() {
        assert_eq!(load_score(&RuntimeStats::default(), &LoadWeights::default()), 0.0);
    }

    #[test]
    fn test_saturated_real_time_path() {
        let mut stats = RuntimeStats::default();
        stats.real_time = ModeStats {
            total: 200,
            success: 0,
            failure: 150,
            timeout: 50,
            avg_time_ms: 500.0,
            ..ModeStats::default()
        };
        let score = load_score(&stats, &LoadWeights::default());
        assert!((score - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_mode_load_averages_factors() {
        let stats = ModeStats {
            total: 50,
            success: 40,
            failure: 10,
            avg_time_ms: 20.0,
            ..ModeStats::default()
        };
        // (0.5 + 0.2 + 0.2) / 3
        assert!((mode_load(&stats, &LoadWeights::default()) - 0.3).abs() < 1e-9);
    }

    fn mode_stats() -> impl Strategy<Value = ModeStats> {
        (
            any::<u32>(),
            any::<u32>(),
            any::<u32>(),
            any::<u32>(),
            prop_oneof![any::<f64>(), Just(f64::NAN), Just(f64::INFINITY), 0.0..10_000.0],
        )
            .prop_map(|(total, success, failure, timeout, avg)| ModeStats {
                total: u64::from(total),
                success: u64::from(success),
                failure: u64::from(failure),
                timeout: u64::from(timeout),
                avg_time_ms: avg,
                ..ModeStats::default()
            })
    }

    proptest! {
        #[test]
        fn prop_load_score_in_unit_interval(rt in mode_stats(), batch in mode_stats()) {
            let mut stats = RuntimeStats::default();
            stats.real_time = rt;
            stats.batch = batch;
            let score = load_score(&stats, &LoadWeights::default());
            prop_assert!((0.0..=1.0).contains(&score));
        }
    }
}
