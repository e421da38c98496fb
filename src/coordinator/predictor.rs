//! Learned performance and failure prediction.
//!
//! Once a peer has enough recorded completions, the selector stops scoring it
//! with the plain heuristic and asks these predictors for an expected
//! completion time and a failure probability instead. Both are simple
//! windowed arithmetic over [`PerformanceHistory`]; no model training, no
//! external numerics.
//!
//! ## Expected time
//!
//! ```text
//! expected_ms = task_type_avg
//!             + 5ms · in_flight
//!             + (hourly_latency_mean − overall_latency_mean)
//! ```
//!
//! ## Failure probability
//!
//! Weighted sum of risk terms, each evaluated against a fixed threshold:
//!
//! ```text
//! p_fail = clamp( 0.3·thermal + 0.2·gpu_sat + 0.1·cpu_sat
//!               + 0.3·(1 − success_rate) + 0.1·jitter, 0, 1 )
//! ```

use crate::common::messages::Telemetry;
use crate::coordinator::history::PerformanceHistory;

/// Linear penalty per concurrent task, in milliseconds.
const MS_PER_IN_FLIGHT: f64 = 5.0;

/// GPU/CPU load above this counts as saturated.
const SATURATION_THRESHOLD: f64 = 0.95;

/// Average jitter above this (ms) counts as an unstable link.
const JITTER_THRESHOLD_MS: f64 = 20.0;

/// Floor for the risk divisor, avoiding divide-by-zero on hopeless peers.
pub const RISK_EPSILON: f64 = 1e-2;

/// Output of the completion-time predictor.
#[derive(Debug, Clone, Copy)]
pub struct Prediction {
    /// Expected completion time in milliseconds
    pub expected_ms: f64,
    /// Confidence in [0, 1], derived from historical variance
    pub confidence: f64,
    /// Probability the peer fails this task, in [0, 1]
    pub failure_probability: f64,
}

impl Prediction {
    /// Expected time inflated by failure risk. A peer predicted to fail half
    /// the time effectively costs twice its expected latency.
    pub fn risk_adjusted_ms(&self) -> f64 {
        self.expected_ms / (1.0 - self.failure_probability).max(RISK_EPSILON)
    }
}

/// Predict completion time and risk for one peer/task pairing.
///
/// `hour` is the local hour of day, used to pick up time-of-day network
/// patterns from the history.
pub fn predict(
    history: &PerformanceHistory,
    telemetry: &Telemetry,
    task_type: &str,
    hour: u8,
    in_flight: usize,
) -> Prediction {
    let base_time = history.task_type_avg(task_type);
    let load_penalty = in_flight as f64 * MS_PER_IN_FLIGHT;
    let time_of_day = history.hourly_latency_avg(hour) - history.avg_latency();

    let expected_ms = (base_time + load_penalty + time_of_day).max(0.0);

    let confidence = if expected_ms > 0.0 {
        (1.0 - (history.std_completion() / expected_ms).min(1.0)).max(0.0)
    } else {
        0.5
    };

    Prediction {
        expected_ms,
        confidence,
        failure_probability: failure_probability(telemetry, history),
    }
}

/// Probability in [0, 1] that a peer fails its next task, from current
/// telemetry and historical reliability.
pub fn failure_probability(telemetry: &Telemetry, history: &PerformanceHistory) -> f64 {
    let thermal_risk = match telemetry.thermal_status.as_str() {
        "critical" => 1.0,
        "high" => 0.5,
        _ => 0.0,
    };
    let gpu_risk = if telemetry.gpu_load > SATURATION_THRESHOLD {
        1.0
    } else {
        0.0
    };
    let cpu_risk = if telemetry.cpu_load > SATURATION_THRESHOLD {
        1.0
    } else {
        0.0
    };
    let jitter_risk = if history.avg_jitter() > JITTER_THRESHOLD_MS {
        1.0
    } else {
        0.0
    };

    let risk = 0.3 * thermal_risk
        + 0.2 * gpu_risk
        + 0.1 * cpu_risk
        + 0.3 * (1.0 - history.success_rate())
        + 0.1 * jitter_risk;

    risk.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn warm_history(task_type: &str, times: &[f64]) -> PerformanceHistory {
        let mut h = PerformanceHistory::new();
        for &t in times {
            h.record_completion(task_type, t, true);
        }
        h
    }

    #[test]
    fn expected_time_adds_load_penalty() {
        let h = warm_history("physics", &[100.0; 20]);
        let idle = predict(&h, &Telemetry::default(), "physics", 12, 0);
        let loaded = predict(&h, &Telemetry::default(), "physics", 12, 2);
        assert!((loaded.expected_ms - idle.expected_ms - 10.0).abs() < 1e-9);
    }

    #[test]
    fn healthy_reliable_peer_has_low_risk() {
        let h = warm_history("physics", &[50.0; 20]);
        let p = failure_probability(&Telemetry::default(), &h);
        assert!(p < 1e-9, "got {}", p);
    }

    #[test]
    fn thermal_and_saturation_raise_risk() {
        let h = warm_history("physics", &[50.0; 20]);
        let hot = Telemetry {
            thermal_status: "critical".into(),
            gpu_load: 0.99,
            cpu_load: 0.99,
            ..Default::default()
        };
        let p = failure_probability(&hot, &h);
        // 0.3 (thermal) + 0.2 (gpu) + 0.1 (cpu)
        assert!((p - 0.6).abs() < 1e-9, "got {}", p);
    }

    #[test]
    fn failure_history_dominates_for_unreliable_peers() {
        let mut h = PerformanceHistory::new();
        for _ in 0..20 {
            h.record_completion("physics", 50.0, false);
        }
        let p = failure_probability(&Telemetry::default(), &h);
        assert!((p - 0.3).abs() < 1e-9, "got {}", p);
    }

    #[test]
    fn risk_adjustment_inflates_expected_time() {
        let p = Prediction {
            expected_ms: 100.0,
            confidence: 1.0,
            failure_probability: 0.5,
        };
        assert!((p.risk_adjusted_ms() - 200.0).abs() < 1e-9);

        // Hopeless peers divide by the epsilon floor, not zero.
        let doomed = Prediction {
            expected_ms: 100.0,
            confidence: 1.0,
            failure_probability: 1.0,
        };
        assert!((doomed.risk_adjusted_ms() - 100.0 / RISK_EPSILON).abs() < 1e-6);
    }
}
