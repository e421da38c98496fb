//! Capability detection and load telemetry for peer nodes.
//!
//! Capabilities are detected once at startup from system information; load
//! telemetry is sampled fresh for every heartbeat.

use std::sync::Mutex;

use sysinfo::System;

use crate::common::messages::{Capabilities, Telemetry};

/// Detect this machine's capabilities. GPU presence cannot be probed
/// portably, so it is declared by the operator.
pub fn detect(gpu: bool, gpu_model: Option<String>) -> Capabilities {
    let mut sys = System::new_all();
    sys.refresh_memory();

    Capabilities {
        cpu_cores: sys.cpus().len().max(1) as u32,
        ram_gb: sys.total_memory() as f64 / 1_000_000_000.0,
        gpu,
        gpu_model,
        network_mbps: None,
        location: None,
    }
}

/// Samples CPU load for heartbeat telemetry.
pub struct TelemetrySampler {
    system: Mutex<System>,
    latency_ms: f64,
}

impl TelemetrySampler {
    /// `latency_ms` is the peer's declared link latency to the coordinator,
    /// reported verbatim in every heartbeat.
    pub fn new(latency_ms: f64) -> Self {
        Self {
            system: Mutex::new(System::new_all()),
            latency_ms,
        }
    }

    /// Current telemetry snapshot.
    pub fn sample(&self) -> Telemetry {
        let mut sys = self.system.lock().unwrap();
        sys.refresh_cpu_all();
        let cpu_load = (sys.global_cpu_usage() as f64 / 100.0).clamp(0.0, 1.0);

        Telemetry {
            cpu_load,
            gpu_load: 0.0,
            latency_ms: self.latency_ms,
            thermal_status: "normal".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_reports_plausible_hardware() {
        let caps = detect(true, Some("RTX 4090".to_string()));
        assert!(caps.cpu_cores >= 1);
        assert!(caps.ram_gb > 0.0);
        assert!(caps.gpu);
        assert_eq!(caps.gpu_model.as_deref(), Some("RTX 4090"));
    }

    #[test]
    fn sampled_telemetry_is_in_range() {
        let sampler = TelemetrySampler::new(12.5);
        let t = sampler.sample();
        assert!((0.0..=1.0).contains(&t.cpu_load));
        assert_eq!(t.latency_ms, 12.5);
        assert_eq!(t.thermal_status, "normal");
    }
}
