//! # Peer Registry
//!
//! Authoritative live peer set, keyed by `peer_id`. Holds each peer's
//! declared capabilities, liveness bookkeeping, reputation, performance
//! history and the serialized writer channel for its connection.
//!
//! Locking: one coarse `RwLock` over the map. All operations complete without
//! suspending while the lock is held; message sends happen outside through
//! the cloned channel senders this registry hands out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Timelike;
use log::{debug, info};
use tokio::sync::{mpsc, RwLock};

use crate::common::messages::{Capabilities, Constraints, Envelope, Telemetry};
use crate::coordinator::history::PerformanceHistory;
use crate::coordinator::selector;

/// Reputation reward for a successful task.
const REPUTATION_REWARD: f64 = 0.02;
/// Reputation penalty for a task's first failure.
const REPUTATION_PENALTY: f64 = 0.05;
/// Reputation penalty when the task had already failed before.
const REPUTATION_PENALTY_REPEAT: f64 = 0.08;

/// Peer liveness/occupancy state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Idle,
    Busy,
}

/// One registered peer.
pub struct PeerEntry {
    pub peer_id: String,
    pub capabilities: Capabilities,
    /// Most recently assigned task, if any assignment is outstanding
    pub current_task: Option<String>,
    /// Number of outstanding assignments, bounded by `max_in_flight`
    pub in_flight: usize,
    pub max_in_flight: usize,
    pub connected_at: f64,
    pub last_heartbeat_at: Instant,
    /// Load fraction the peer last reported, in [0, 1]
    pub reported_load: f64,
    pub telemetry: Telemetry,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Smoothed success score in [0, 1], used as a selection penalty
    pub reputation: f64,
    /// Transport session this entry belongs to; a reconnect gets a new one
    pub session: u64,
    /// Serialized writer channel for this peer's connection
    pub sender: mpsc::Sender<Envelope>,
    pub history: PerformanceHistory,
}

impl PeerEntry {
    /// A peer is busy exactly while it has outstanding assignments.
    pub fn status(&self) -> PeerStatus {
        if self.in_flight > 0 {
            PeerStatus::Busy
        } else {
            PeerStatus::Idle
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.in_flight < self.max_in_flight
    }
}

/// How an outstanding assignment ended, from the peer's point of view.
pub enum ReleaseOutcome {
    /// The peer returned a successful result.
    Success { task_type: String, elapsed_ms: f64 },
    /// The peer failed, timed out or was reclaimed; `repeat` marks a task
    /// that had already failed once before.
    Failure {
        task_type: String,
        elapsed_ms: f64,
        repeat: bool,
    },
    /// Free the slot without touching counters or reputation (used when a
    /// task completes through another peer's late result).
    Detach,
}

/// Live peer set plus the selection entry point.
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, PeerEntry>>,
    next_session: AtomicU64,
    max_in_flight: usize,
    initial_reputation: f64,
}

impl PeerRegistry {
    pub fn new(max_in_flight: usize, initial_reputation: f64) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            max_in_flight,
            initial_reputation: initial_reputation.clamp(0.0, 1.0),
        }
    }

    /// Register a peer, returning its new session id.
    ///
    /// The caller is responsible for reclaiming a previous session's tasks
    /// before re-registering the same `peer_id`; this method simply replaces
    /// any existing entry.
    pub async fn register(
        &self,
        peer_id: &str,
        capabilities: Capabilities,
        sender: mpsc::Sender<Envelope>,
    ) -> u64 {
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        let entry = PeerEntry {
            peer_id: peer_id.to_string(),
            capabilities,
            current_task: None,
            in_flight: 0,
            max_in_flight: self.max_in_flight,
            connected_at: crate::common::messages::now_ts(),
            last_heartbeat_at: Instant::now(),
            reported_load: 0.0,
            telemetry: Telemetry::default(),
            tasks_completed: 0,
            tasks_failed: 0,
            reputation: self.initial_reputation,
            session,
            sender,
            history: PerformanceHistory::new(),
        };

        let mut peers = self.peers.write().await;
        peers.insert(peer_id.to_string(), entry);
        info!("✓ Registered peer: {} (session {})", peer_id, session);
        session
    }

    /// Session id of a currently registered peer, if any.
    pub async fn session_of(&self, peer_id: &str) -> Option<u64> {
        self.peers.read().await.get(peer_id).map(|p| p.session)
    }

    /// Refresh liveness and telemetry from a heartbeat. Returns false for
    /// unknown peers.
    pub async fn heartbeat(&self, peer_id: &str, load: f64, telemetry: Telemetry) -> bool {
        let hour = chrono::Local::now().hour() as u8;
        let mut peers = self.peers.write().await;
        match peers.get_mut(peer_id) {
            Some(entry) => {
                entry.last_heartbeat_at = Instant::now();
                entry.reported_load = load;
                entry.history.record_latency(telemetry.latency_ms, hour);
                entry.telemetry = telemetry;
                true
            }
            None => false,
        }
    }

    /// Remove a peer unconditionally. Returns true if it was present.
    pub async fn unregister(&self, peer_id: &str, reason: &str) -> bool {
        let removed = self.peers.write().await.remove(peer_id).is_some();
        if removed {
            info!("✗ Unregistered peer: {} ({})", peer_id, reason);
        }
        removed
    }

    /// Remove a peer only if it still belongs to the given session. Keeps a
    /// stale connection's teardown from killing a newer session that already
    /// replaced it.
    pub async fn unregister_if_session(&self, peer_id: &str, session: u64, reason: &str) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get(peer_id) {
            Some(entry) if entry.session == session => {
                peers.remove(peer_id);
                info!("✗ Unregistered peer: {} ({})", peer_id, reason);
                true
            }
            _ => false,
        }
    }

    /// Peers whose last heartbeat is older than `timeout`.
    pub async fn stale_peers(&self, timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        self.peers
            .read()
            .await
            .values()
            .filter(|p| now.duration_since(p.last_heartbeat_at) > timeout)
            .map(|p| p.peer_id.clone())
            .collect()
    }

    /// Select the best peer for a task and reserve a slot on it, atomically.
    ///
    /// Returns the chosen peer id and its writer channel. Peers listed in
    /// `tried` are excluded unless every eligible peer has been tried.
    pub async fn acquire_peer(
        &self,
        task_id: &str,
        task_type: &str,
        constraints: &Constraints,
        tried: &[String],
        min_training_samples: usize,
    ) -> Option<(String, mpsc::Sender<Envelope>)> {
        let hour = chrono::Local::now().hour() as u8;
        let mut peers = self.peers.write().await;

        let chosen = selector::select(
            peers.values(),
            task_type,
            constraints,
            tried,
            min_training_samples,
            hour,
        )?
        .to_string();

        let entry = peers.get_mut(&chosen)?;
        entry.in_flight += 1;
        entry.current_task = Some(task_id.to_string());
        debug!(
            "📌 Reserved slot on {} for task {} (in_flight: {})",
            chosen, task_id, entry.in_flight
        );
        Some((chosen, entry.sender.clone()))
    }

    /// Release an outstanding assignment, updating counters, reputation and
    /// history according to the outcome.
    pub async fn release(&self, peer_id: &str, task_id: &str, outcome: ReleaseOutcome) {
        let mut peers = self.peers.write().await;
        let entry = match peers.get_mut(peer_id) {
            Some(e) => e,
            // Peer already gone (disconnect path); nothing to update.
            None => return,
        };

        entry.in_flight = entry.in_flight.saturating_sub(1);
        if entry.current_task.as_deref() == Some(task_id) {
            entry.current_task = None;
        }

        match outcome {
            ReleaseOutcome::Success {
                task_type,
                elapsed_ms,
            } => {
                entry.tasks_completed += 1;
                entry.reputation = (entry.reputation + REPUTATION_REWARD).min(1.0);
                entry.history.record_completion(&task_type, elapsed_ms, true);
            }
            ReleaseOutcome::Failure {
                task_type,
                elapsed_ms,
                repeat,
            } => {
                entry.tasks_failed += 1;
                let penalty = if repeat {
                    REPUTATION_PENALTY_REPEAT
                } else {
                    REPUTATION_PENALTY
                };
                entry.reputation = (entry.reputation - penalty).max(0.0);
                entry
                    .history
                    .record_completion(&task_type, elapsed_ms, false);
            }
            ReleaseOutcome::Detach => {}
        }
    }

    /// Writer channel of a registered peer.
    pub async fn sender_of(&self, peer_id: &str) -> Option<mpsc::Sender<Envelope>> {
        self.peers.read().await.get(peer_id).map(|p| p.sender.clone())
    }

    /// Whether any registered peer satisfies the constraints at all,
    /// regardless of its current load. Distinguishes "everyone is busy"
    /// (task waits in the queue) from "nobody can ever run this"
    /// (fail fast with no_peers).
    pub async fn any_eligible(&self, constraints: &Constraints) -> bool {
        self.peers
            .read()
            .await
            .values()
            .any(|p| constraints.satisfied_by(&p.capabilities))
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Peers currently able to take work.
    pub async fn available_count(&self) -> usize {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.has_capacity())
            .count()
    }

    /// Sum of outstanding assignments across all peers.
    pub async fn total_in_flight(&self) -> usize {
        self.peers.read().await.values().map(|p| p.in_flight).sum()
    }

    pub async fn reputation_of(&self, peer_id: &str) -> Option<f64> {
        self.peers.read().await.get(peer_id).map(|p| p.reputation)
    }

    /// (tasks_completed, tasks_failed) counters of a peer.
    pub async fn counters_of(&self, peer_id: &str) -> Option<(u64, u64)> {
        self.peers
            .read()
            .await
            .get(peer_id)
            .map(|p| (p.tasks_completed, p.tasks_failed))
    }

    pub async fn in_flight_of(&self, peer_id: &str) -> Option<usize> {
        self.peers.read().await.get(peer_id).map(|p| p.in_flight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> Capabilities {
        Capabilities {
            cpu_cores: 8,
            ram_gb: 16.0,
            gpu: true,
            ..Default::default()
        }
    }

    async fn registry_with(peer_ids: &[&str]) -> PeerRegistry {
        let registry = PeerRegistry::new(2, 0.8);
        for id in peer_ids {
            let (tx, _rx) = mpsc::channel(8);
            registry.register(id, caps(), tx).await;
        }
        registry
    }

    #[tokio::test]
    async fn register_and_reserve_tracks_in_flight() {
        let registry = registry_with(&["peer_1"]).await;
        assert_eq!(registry.len().await, 1);

        let (chosen, _tx) = registry
            .acquire_peer("t1", "physics", &Constraints::default(), &[], 10)
            .await
            .unwrap();
        assert_eq!(chosen, "peer_1");
        assert_eq!(registry.in_flight_of("peer_1").await, Some(1));
        assert_eq!(registry.total_in_flight().await, 1);

        registry
            .release(
                "peer_1",
                "t1",
                ReleaseOutcome::Success {
                    task_type: "physics".into(),
                    elapsed_ms: 12.0,
                },
            )
            .await;
        assert_eq!(registry.in_flight_of("peer_1").await, Some(0));
        assert_eq!(registry.counters_of("peer_1").await, Some((1, 0)));
    }

    #[tokio::test]
    async fn reputation_moves_by_bounded_steps() {
        let registry = registry_with(&["peer_1"]).await;
        let initial = registry.reputation_of("peer_1").await.unwrap();

        let (_, _tx) = registry
            .acquire_peer("t1", "physics", &Constraints::default(), &[], 10)
            .await
            .unwrap();
        registry
            .release(
                "peer_1",
                "t1",
                ReleaseOutcome::Failure {
                    task_type: "physics".into(),
                    elapsed_ms: 5.0,
                    repeat: false,
                },
            )
            .await;
        let after_fail = registry.reputation_of("peer_1").await.unwrap();
        assert!((initial - after_fail - 0.05).abs() < 1e-9);

        let (_, _tx) = registry
            .acquire_peer("t2", "physics", &Constraints::default(), &[], 10)
            .await
            .unwrap();
        registry
            .release(
                "peer_1",
                "t2",
                ReleaseOutcome::Success {
                    task_type: "physics".into(),
                    elapsed_ms: 5.0,
                },
            )
            .await;
        let after_success = registry.reputation_of("peer_1").await.unwrap();
        assert!((after_success - after_fail - 0.02).abs() < 1e-9);
    }

    #[tokio::test]
    async fn capacity_limits_reservations() {
        let registry = registry_with(&["peer_1"]).await;

        assert!(registry
            .acquire_peer("t1", "physics", &Constraints::default(), &[], 10)
            .await
            .is_some());
        assert!(registry
            .acquire_peer("t2", "physics", &Constraints::default(), &[], 10)
            .await
            .is_some());
        // max_in_flight = 2: the third reservation finds no candidate.
        assert!(registry
            .acquire_peer("t3", "physics", &Constraints::default(), &[], 10)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn constraints_filter_candidates() {
        let registry = PeerRegistry::new(2, 0.8);
        let (tx, _rx) = mpsc::channel(8);
        registry
            .register(
                "cpu_only",
                Capabilities {
                    cpu_cores: 4,
                    ram_gb: 8.0,
                    gpu: false,
                    ..Default::default()
                },
                tx,
            )
            .await;

        let gpu_task = Constraints {
            requires_gpu: true,
            ..Default::default()
        };
        assert!(registry
            .acquire_peer("t1", "raytracing", &gpu_task, &[], 10)
            .await
            .is_none());
        assert!(registry
            .acquire_peer("t1", "physics", &Constraints::default(), &[], 10)
            .await
            .is_some());
    }

    #[tokio::test]
    async fn stale_peers_are_reported() {
        let registry = registry_with(&["peer_1"]).await;
        assert!(registry
            .stale_peers(Duration::from_secs(30))
            .await
            .is_empty());
        // A zero timeout makes every peer stale.
        assert_eq!(
            registry.stale_peers(Duration::from_nanos(0)).await,
            vec!["peer_1".to_string()]
        );
    }

    #[tokio::test]
    async fn session_guard_protects_replacement_registrations() {
        let registry = registry_with(&["peer_1"]).await;
        let old_session = registry.session_of("peer_1").await.unwrap();

        // Same peer_id reconnects: new session replaces the old entry.
        let (tx, _rx) = mpsc::channel(8);
        let new_session = registry.register("peer_1", caps(), tx).await;
        assert_ne!(old_session, new_session);

        // The old connection's teardown must not remove the new entry.
        assert!(
            !registry
                .unregister_if_session("peer_1", old_session, "connection_lost")
                .await
        );
        assert_eq!(registry.len().await, 1);
        assert!(
            registry
                .unregister_if_session("peer_1", new_session, "connection_lost")
                .await
        );
        assert_eq!(registry.len().await, 0);
    }
}
