//! Coordinator configuration.
//!
//! Loaded from a TOML file (all fields optional, falling back to the defaults
//! below) and overridable from the command line.

use serde::{Deserialize, Serialize};

use crate::common::config::load_config;

/// Complete coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Interface to bind the listener on
    pub listen_host: String,
    /// TCP port for peer and renter connections
    pub listen_port: u16,
    /// Peers silent longer than this are declared offline
    pub peer_timeout_s: u64,
    /// Expected heartbeat cadence from peers
    pub heartbeat_interval_s: u64,
    /// How often the liveness sweep runs
    pub monitor_interval_s: u64,
    /// Maximum assignments per task (initial + retries)
    pub max_attempts: u32,
    /// Result cache time-to-live
    pub result_cache_ttl_s: u64,
    /// Bounded submit queue capacity; submits beyond it fail with queue_full
    pub submit_queue_capacity: usize,
    /// Observations a peer needs before the learned predictor is trusted
    pub min_training_samples: usize,
    /// Concurrent assignments allowed per peer
    pub max_in_flight_per_peer: usize,
    /// Deadline applied to tasks that do not carry one
    pub default_deadline_ms: u64,
    /// Maximum number of cached results held in memory
    pub cache_capacity: usize,
    /// How often expired cache entries are swept
    pub cache_sweep_interval_s: u64,
    /// Reputation assigned to freshly registered peers
    pub initial_reputation: f64,
    /// SQLite database path; persistence is disabled when unset
    pub db_path: Option<String>,
    /// What renters are charged, $ per compute-hour
    pub gamer_rate_usd_hr: f64,
    /// What peers earn, $ per compute-hour
    pub peer_rate_usd_hr: f64,
    /// Coordinator's cut of each task cost
    pub coordinator_fee: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 8765,
            peer_timeout_s: 30,
            heartbeat_interval_s: 5,
            monitor_interval_s: 10,
            max_attempts: 3,
            result_cache_ttl_s: 86_400,
            submit_queue_capacity: 100,
            min_training_samples: 10,
            max_in_flight_per_peer: 2,
            default_deadline_ms: 5_000,
            cache_capacity: 1024,
            cache_sweep_interval_s: 60,
            initial_reputation: 0.8,
            db_path: None,
            gamer_rate_usd_hr: 0.01,
            peer_rate_usd_hr: 0.15,
            coordinator_fee: 0.10,
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        load_config(path)
    }

    /// Cost charged to the renter for one task, from its processing time.
    pub fn task_cost_usd(&self, processing_time_ms: f64) -> f64 {
        processing_time_ms / 3_600_000.0 * self.gamer_rate_usd_hr
    }

    /// Earning credited to the executing peer for one task.
    pub fn peer_earning_usd(&self, processing_time_ms: f64) -> f64 {
        processing_time_ms / 3_600_000.0 * self.peer_rate_usd_hr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = CoordinatorConfig::default();
        assert_eq!(cfg.listen_port, 8765);
        assert_eq!(cfg.peer_timeout_s, 30);
        assert_eq!(cfg.heartbeat_interval_s, 5);
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.result_cache_ttl_s, 86_400);
        assert_eq!(cfg.submit_queue_capacity, 100);
        assert_eq!(cfg.min_training_samples, 10);
        assert_eq!(cfg.max_in_flight_per_peer, 2);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let cfg: CoordinatorConfig =
            toml::from_str("listen_port = 9000\nmax_attempts = 5\n").unwrap();
        assert_eq!(cfg.listen_port, 9000);
        assert_eq!(cfg.max_attempts, 5);
        assert_eq!(cfg.submit_queue_capacity, 100);
    }

    #[test]
    fn billing_is_proportional_to_processing_time() {
        let cfg = CoordinatorConfig::default();
        // One full compute-hour costs exactly the hourly rate.
        assert!((cfg.task_cost_usd(3_600_000.0) - cfg.gamer_rate_usd_hr).abs() < 1e-12);
        assert!(cfg.peer_earning_usd(1_000.0) > 0.0);
    }
}
