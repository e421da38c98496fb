//! Per-peer performance history.
//!
//! Windowed statistics over a peer's recent task completions and reported
//! latencies. The selector reads these through snapshots; only the scheduler
//! mutates them, when a result or heartbeat is recorded. Never exposed to
//! renters.

use std::collections::{HashMap, VecDeque};

/// Completion-time samples retained per peer.
const COMPLETION_WINDOW: usize = 1000;
/// Samples retained per task type.
const TASK_TYPE_WINDOW: usize = 100;
/// Latency and jitter samples retained.
const LATENCY_WINDOW: usize = 100;
/// Latency samples the jitter estimate is computed over.
const JITTER_SPAN: usize = 10;

/// Fallbacks used before any samples exist.
const DEFAULT_COMPLETION_MS: f64 = 100.0;
const DEFAULT_STD_MS: f64 = 50.0;
const DEFAULT_LATENCY_MS: f64 = 50.0;

/// Bounded ring buffers of a peer's recent behavior.
#[derive(Debug, Clone, Default)]
pub struct PerformanceHistory {
    completion_times: VecDeque<f64>,
    success_count: u64,
    failure_count: u64,
    task_type_times: HashMap<String, VecDeque<f64>>,
    hourly_latency: HashMap<u8, VecDeque<f64>>,
    latency: VecDeque<f64>,
    jitter: VecDeque<f64>,
}

impl PerformanceHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished task: its wall time, outcome and type.
    pub fn record_completion(&mut self, task_type: &str, elapsed_ms: f64, success: bool) {
        push_bounded(&mut self.completion_times, elapsed_ms, COMPLETION_WINDOW);

        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }

        let per_type = self.task_type_times.entry(task_type.to_string()).or_default();
        push_bounded(per_type, elapsed_ms, TASK_TYPE_WINDOW);
    }

    /// Record a reported latency sample, tagged with the local hour of day.
    ///
    /// Each sample also refreshes the jitter estimate: the standard deviation
    /// of the last [`JITTER_SPAN`] latencies.
    pub fn record_latency(&mut self, latency_ms: f64, hour: u8) {
        push_bounded(&mut self.latency, latency_ms, LATENCY_WINDOW);

        let hourly = self.hourly_latency.entry(hour % 24).or_default();
        push_bounded(hourly, latency_ms, LATENCY_WINDOW);

        if self.latency.len() > 1 {
            let span: Vec<f64> = self
                .latency
                .iter()
                .rev()
                .take(JITTER_SPAN)
                .copied()
                .collect();
            push_bounded(&mut self.jitter, std_dev(&span), LATENCY_WINDOW);
        }
    }

    /// Number of completion samples recorded so far. The learned predictor is
    /// only consulted once this reaches `min_training_samples`.
    pub fn samples(&self) -> usize {
        self.completion_times.len()
    }

    /// Fraction of recorded outcomes that succeeded; 0.5 before any data.
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            0.5
        } else {
            self.success_count as f64 / total as f64
        }
    }

    /// Mean completion time across all task types.
    pub fn avg_completion(&self) -> f64 {
        mean(self.completion_times.iter()).unwrap_or(DEFAULT_COMPLETION_MS)
    }

    /// Standard deviation of completion times.
    pub fn std_completion(&self) -> f64 {
        if self.completion_times.len() < 2 {
            DEFAULT_STD_MS
        } else {
            let samples: Vec<f64> = self.completion_times.iter().copied().collect();
            std_dev(&samples)
        }
    }

    /// Mean completion time for one task type, falling back to the overall
    /// mean when that type has no history.
    pub fn task_type_avg(&self, task_type: &str) -> f64 {
        self.task_type_times
            .get(task_type)
            .and_then(|times| mean(times.iter()))
            .unwrap_or_else(|| self.avg_completion())
    }

    /// Mean reported latency across all hours.
    pub fn avg_latency(&self) -> f64 {
        mean(self.latency.iter()).unwrap_or(DEFAULT_LATENCY_MS)
    }

    /// Mean latency during one hour of the day, falling back to the overall
    /// latency mean.
    pub fn hourly_latency_avg(&self, hour: u8) -> f64 {
        self.hourly_latency
            .get(&(hour % 24))
            .and_then(|samples| mean(samples.iter()))
            .unwrap_or_else(|| self.avg_latency())
    }

    /// Mean of recent jitter estimates; 0 before enough latency samples.
    pub fn avg_jitter(&self) -> f64 {
        mean(self.jitter.iter()).unwrap_or(0.0)
    }
}

fn push_bounded(buf: &mut VecDeque<f64>, value: f64, cap: usize) {
    if buf.len() == cap {
        buf.pop_front();
    }
    buf.push_back(value);
}

fn mean<'a>(values: impl Iterator<Item = &'a f64>) -> Option<f64> {
    let mut sum = 0.0;
    let mut count = 0usize;
    for v in values {
        sum += v;
        count += 1;
    }
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = values.iter().sum::<f64>() / values.len() as f64;
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_rate_starts_neutral_and_tracks_outcomes() {
        let mut h = PerformanceHistory::new();
        assert_eq!(h.success_rate(), 0.5);

        h.record_completion("physics", 10.0, true);
        h.record_completion("physics", 12.0, true);
        h.record_completion("physics", 80.0, false);
        assert!((h.success_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(h.samples(), 3);
    }

    #[test]
    fn completion_window_is_bounded() {
        let mut h = PerformanceHistory::new();
        for i in 0..1500 {
            h.record_completion("raytracing", i as f64, true);
        }
        assert_eq!(h.samples(), 1000);
        // Oldest samples (0..500) dropped: the mean is over the last 1000.
        assert!(h.avg_completion() > 499.0);
    }

    #[test]
    fn task_type_average_falls_back_to_overall() {
        let mut h = PerformanceHistory::new();
        h.record_completion("physics", 20.0, true);
        h.record_completion("physics", 40.0, true);

        assert!((h.task_type_avg("physics") - 30.0).abs() < 1e-9);
        // No raytracing history: falls back to the overall mean.
        assert!((h.task_type_avg("raytracing") - 30.0).abs() < 1e-9);
    }

    #[test]
    fn hourly_latency_falls_back_to_overall_latency() {
        let mut h = PerformanceHistory::new();
        h.record_latency(10.0, 3);
        h.record_latency(30.0, 3);

        assert!((h.hourly_latency_avg(3) - 20.0).abs() < 1e-9);
        assert!((h.hourly_latency_avg(15) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn jitter_reflects_latency_variance() {
        let mut steady = PerformanceHistory::new();
        let mut noisy = PerformanceHistory::new();
        for i in 0..20 {
            steady.record_latency(10.0, 0);
            noisy.record_latency(if i % 2 == 0 { 5.0 } else { 100.0 }, 0);
        }
        assert!(steady.avg_jitter() < 1e-9);
        assert!(noisy.avg_jitter() > 20.0);
    }
}
