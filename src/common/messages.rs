//! # Message Protocol
//!
//! Defines all message types exchanged in the P2C2R network:
//! - Peer registration, heartbeats and task assignment (Coordinator ↔ Peer)
//! - Renter registration, task submission and result delivery (Coordinator ↔ Renter)
//!
//! Every frame on the wire is an [`Envelope`]: a `msg_id` / `timestamp` pair
//! plus one [`Message`] variant, serialized to JSON and sent over TCP with a
//! 4-byte length prefix. The `msg_type` discriminator is inlined into the JSON
//! object so every message is self-describing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declared hardware capabilities of a peer, captured at registration.
///
/// The coordinator matches these against task [`Constraints`] when selecting
/// a peer; they are never re-detected after registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    /// Number of CPU cores available for task execution
    pub cpu_cores: u32,
    /// Total system memory in gigabytes
    pub ram_gb: f64,
    /// Whether a GPU is available
    pub gpu: bool,
    /// GPU model name, if known (e.g. "RTX 4090")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_model: Option<String>,
    /// Measured or declared network bandwidth in Mbps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mbps: Option<f64>,
    /// Coarse location tag used only for logging
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            cpu_cores: 1,
            ram_gb: 1.0,
            gpu: false,
            gpu_model: None,
            network_mbps: None,
            location: None,
        }
    }
}

/// Capability requirements a task places on candidate peers.
///
/// A peer is eligible for a task only if [`Constraints::satisfied_by`] holds
/// for its declared [`Capabilities`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Constraints {
    /// Task requires a GPU
    #[serde(default)]
    pub requires_gpu: bool,
    /// Minimum number of CPU cores
    #[serde(default)]
    pub min_cpu_cores: u32,
    /// Minimum system memory in gigabytes
    #[serde(default)]
    pub min_ram_gb: f64,
}

impl Constraints {
    /// Check whether a peer's declared capabilities satisfy these constraints.
    pub fn satisfied_by(&self, caps: &Capabilities) -> bool {
        if self.requires_gpu && !caps.gpu {
            return false;
        }
        if caps.cpu_cores < self.min_cpu_cores {
            return false;
        }
        if caps.ram_gb < self.min_ram_gb {
            return false;
        }
        true
    }
}

/// Live load telemetry carried in peer heartbeats.
///
/// Consumed by the failure predictor; all fields are best-effort and default
/// to a healthy reading when a peer omits them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Telemetry {
    /// CPU load in [0, 1]
    #[serde(default)]
    pub cpu_load: f64,
    /// GPU load in [0, 1]
    #[serde(default)]
    pub gpu_load: f64,
    /// Reported network latency to the coordinator in milliseconds
    #[serde(default)]
    pub latency_ms: f64,
    /// Thermal state: "normal", "high" or "critical"
    #[serde(default = "default_thermal")]
    pub thermal_status: String,
}

fn default_thermal() -> String {
    "normal".to_string()
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            cpu_load: 0.0,
            gpu_load: 0.0,
            latency_ms: 0.0,
            thermal_status: default_thermal(),
        }
    }
}

/// Core message enum for all communication in the P2C2R network.
///
/// Serialized with an inline `msg_type` tag in snake_case, so the wire form of
/// e.g. [`Message::TaskAssign`] is
/// `{"msg_type": "task_assign", "task_id": ..., ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "msg_type", rename_all = "snake_case")]
pub enum Message {
    // ========== REGISTRATION ==========
    /// Peer announces itself and its capabilities. First message on a peer
    /// connection; a `peer_id` already registered from another live session
    /// has that session's tasks reclaimed before this one is accepted.
    PeerRegister {
        peer_id: String,
        capabilities: Capabilities,
    },

    /// Coordinator's answer to `peer_register`.
    PeerRegisterResponse {
        success: bool,
        peer_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Renter announces itself. First message on a renter connection.
    GamerRegister { client_id: String },

    /// Coordinator's answer to `gamer_register`, including how many peers are
    /// currently able to take work.
    GamerRegisterResponse {
        success: bool,
        client_id: String,
        #[serde(default)]
        available_peers: usize,
    },

    // ========== TASK FLOW ==========
    /// Renter submits one unit of work. `task_id` is chosen by the renter and
    /// must be unique; `deadline_ms` and `constraints` are optional and take
    /// coordinator defaults when omitted.
    TaskSubmit {
        task_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
        task_type: String,
        data: Vec<u8>,
        #[serde(default)]
        params: BTreeMap<String, serde_json::Value>,
        #[serde(default)]
        priority: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deadline_ms: Option<u64>,
        #[serde(default)]
        constraints: Constraints,
        requester_id: String,
    },

    /// Coordinator hands a task to the selected peer.
    TaskAssign {
        task_id: String,
        task_type: String,
        data: Vec<u8>,
        #[serde(default)]
        params: BTreeMap<String, serde_json::Value>,
    },

    /// Peer reports the outcome of an assigned task.
    TaskResult {
        task_id: String,
        peer_id: String,
        success: bool,
        result: Vec<u8>,
        processing_time_ms: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Coordinator delivers a terminal outcome to the submitting renter.
    /// Together with `task_timeout` this forms the single terminal event
    /// emitted per `task_id`.
    ResultDelivery {
        task_id: String,
        success: bool,
        result: Vec<u8>,
        processing_time_ms: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// True when served from the result cache or a deduplicated
        /// in-flight computation; no peer was consulted for this delivery.
        #[serde(default)]
        cached: bool,
        #[serde(default)]
        cost_usd: f64,
    },

    /// Coordinator tells the renter a task ran out of time or attempts.
    /// `error` carries the concise reason ("timeout", "exhausted_attempts").
    TaskTimeout { task_id: String, error: String },

    // ========== LIVENESS ==========
    /// Periodic peer liveness report with load telemetry.
    Heartbeat {
        peer_id: String,
        /// Fraction of the peer's task slots in use, in [0, 1]
        load: f64,
        tasks_completed: u64,
        tasks_failed: u64,
        #[serde(default)]
        telemetry: Telemetry,
    },

    /// Internal coordinator event recorded when a peer connection drops or
    /// times out. Never sent to peers; used for logging and storage.
    PeerDisconnect { peer_id: String, reason: String },
}

impl Message {
    /// Short tag for logging, matching the wire `msg_type`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::PeerRegister { .. } => "peer_register",
            Message::PeerRegisterResponse { .. } => "peer_register_response",
            Message::GamerRegister { .. } => "gamer_register",
            Message::GamerRegisterResponse { .. } => "gamer_register_response",
            Message::TaskSubmit { .. } => "task_submit",
            Message::TaskAssign { .. } => "task_assign",
            Message::TaskResult { .. } => "task_result",
            Message::ResultDelivery { .. } => "result_delivery",
            Message::TaskTimeout { .. } => "task_timeout",
            Message::Heartbeat { .. } => "heartbeat",
            Message::PeerDisconnect { .. } => "peer_disconnect",
        }
    }
}

/// Wire envelope: unique message id, send timestamp and the message itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique id for this frame (uuid v4)
    pub msg_id: String,
    /// Seconds since epoch at send time
    pub timestamp: f64,
    #[serde(flatten)]
    pub msg: Message,
}

impl Envelope {
    /// Wrap a message with a fresh `msg_id` and the current timestamp.
    pub fn new(msg: Message) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            timestamp: now_ts(),
            msg,
        }
    }

    /// Serialize the envelope to JSON bytes for transmission.
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize an envelope from JSON bytes received from the network.
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Current time as seconds since the Unix epoch.
pub fn now_ts() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let env = Envelope::new(Message::Heartbeat {
            peer_id: "peer_1".into(),
            load: 0.5,
            tasks_completed: 3,
            tasks_failed: 1,
            telemetry: Telemetry::default(),
        });

        let bytes = env.to_bytes().unwrap();
        let parsed = Envelope::from_bytes(&bytes).unwrap();

        match parsed.msg {
            Message::Heartbeat {
                peer_id,
                load,
                tasks_completed,
                ..
            } => {
                assert_eq!(peer_id, "peer_1");
                assert_eq!(load, 0.5);
                assert_eq!(tasks_completed, 3);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn msg_type_tag_is_inlined() {
        let env = Envelope::new(Message::TaskTimeout {
            task_id: "t1".into(),
            error: "timeout".into(),
        });

        let json: serde_json::Value =
            serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(json["msg_type"], "task_timeout");
        assert_eq!(json["task_id"], "t1");
        assert!(json["msg_id"].is_string());
    }

    #[test]
    fn constraints_match_capabilities() {
        let caps = Capabilities {
            cpu_cores: 8,
            ram_gb: 16.0,
            gpu: false,
            ..Default::default()
        };

        assert!(Constraints::default().satisfied_by(&caps));
        assert!(Constraints {
            min_cpu_cores: 8,
            ..Default::default()
        }
        .satisfied_by(&caps));
        assert!(!Constraints {
            min_cpu_cores: 12,
            ..Default::default()
        }
        .satisfied_by(&caps));
        assert!(!Constraints {
            requires_gpu: true,
            ..Default::default()
        }
        .satisfied_by(&caps));
        assert!(!Constraints {
            min_ram_gb: 32.0,
            ..Default::default()
        }
        .satisfied_by(&caps));
    }

    #[test]
    fn submit_defaults_apply_when_fields_omitted() {
        let raw = br#"{
            "msg_id": "m1",
            "timestamp": 1.0,
            "msg_type": "task_submit",
            "task_id": "t1",
            "task_type": "physics",
            "data": [1, 2, 3],
            "requester_id": "gamer_1"
        }"#;

        let env = Envelope::from_bytes(raw).unwrap();
        match env.msg {
            Message::TaskSubmit {
                priority,
                deadline_ms,
                constraints,
                params,
                ..
            } => {
                assert_eq!(priority, 0);
                assert!(deadline_ms.is_none());
                assert!(!constraints.requires_gpu);
                assert!(params.is_empty());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
