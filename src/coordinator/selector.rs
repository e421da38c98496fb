//! # Peer Selection Policy
//!
//! Scores every eligible peer for a task and picks the minimum. Two scoring
//! components compose:
//!
//! **Heuristic** (always available):
//! ```text
//! score = reported_latency_ms + 15·in_flight + 50·(1 − reputation)
//! ```
//!
//! **Learned** (once a peer has `min_training_samples` recorded completions):
//! the predictor's risk-adjusted expected time plus reported latency. See
//! [`crate::coordinator::predictor`] for the formulas.
//!
//! Ties break on larger reputation, then lower in-flight count, then a
//! deterministic hash of the peer id, so identical state always yields the
//! same choice. Selection never mutates peer state; the registry composes it
//! with slot reservation under one lock.

use crate::common::messages::Constraints;
use crate::coordinator::predictor;
use crate::coordinator::registry::PeerEntry;

/// Score weight per outstanding assignment.
pub const K_LOAD: f64 = 15.0;
/// Score weight for missing reputation.
pub const K_REP: f64 = 50.0;

/// Heuristic score used until a peer has enough history. Lower is better.
pub fn heuristic_score(entry: &PeerEntry) -> f64 {
    entry.telemetry.latency_ms
        + K_LOAD * entry.in_flight as f64
        + K_REP * (1.0 - entry.reputation)
}

/// Score one peer for a task. Uses the learned predictor once the peer has
/// `min_training_samples` completions, the heuristic otherwise.
pub fn score(
    entry: &PeerEntry,
    task_type: &str,
    hour: u8,
    min_training_samples: usize,
) -> f64 {
    if entry.history.samples() >= min_training_samples {
        let prediction = predictor::predict(
            &entry.history,
            &entry.telemetry,
            task_type,
            hour,
            entry.in_flight,
        );
        prediction.risk_adjusted_ms() + entry.telemetry.latency_ms
    } else {
        heuristic_score(entry)
    }
}

/// Pick the best peer for a task from a registry snapshot.
///
/// Eligibility: spare capacity and capabilities satisfying the task's
/// constraints. Peers in `tried` are excluded, unless that would leave no
/// candidate at all (then previously tried peers become eligible again).
pub fn select<'a>(
    entries: impl Iterator<Item = &'a PeerEntry>,
    task_type: &str,
    constraints: &Constraints,
    tried: &[String],
    min_training_samples: usize,
    hour: u8,
) -> Option<&'a str> {
    let eligible: Vec<&PeerEntry> = entries
        .filter(|p| p.has_capacity() && constraints.satisfied_by(&p.capabilities))
        .collect();

    let fresh: Vec<&PeerEntry> = eligible
        .iter()
        .copied()
        .filter(|p| !tried.contains(&p.peer_id))
        .collect();

    let candidates = if fresh.is_empty() { eligible } else { fresh };

    candidates
        .into_iter()
        .min_by(|a, b| {
            let score_a = score(a, task_type, hour, min_training_samples);
            let score_b = score(b, task_type, hour, min_training_samples);
            score_a
                .total_cmp(&score_b)
                .then(b.reputation.total_cmp(&a.reputation))
                .then(a.in_flight.cmp(&b.in_flight))
                .then(peer_hash(&a.peer_id).cmp(&peer_hash(&b.peer_id)))
        })
        .map(|p| p.peer_id.as_str())
}

/// Deterministic hash of a peer id, used as the final tie-breaker.
fn peer_hash(peer_id: &str) -> u64 {
    peer_id
        .bytes()
        .fold(0u64, |h, b| h.wrapping_mul(31).wrapping_add(b as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::messages::{Capabilities, Telemetry};
    use crate::coordinator::history::PerformanceHistory;
    use std::time::Instant;
    use tokio::sync::mpsc;

    fn entry(peer_id: &str) -> PeerEntry {
        let (tx, _rx) = mpsc::channel(1);
        PeerEntry {
            peer_id: peer_id.to_string(),
            capabilities: Capabilities {
                cpu_cores: 8,
                ram_gb: 16.0,
                gpu: true,
                ..Default::default()
            },
            current_task: None,
            in_flight: 0,
            max_in_flight: 2,
            connected_at: 0.0,
            last_heartbeat_at: Instant::now(),
            reported_load: 0.0,
            telemetry: Telemetry::default(),
            tasks_completed: 0,
            tasks_failed: 0,
            reputation: 0.8,
            session: 1,
            sender: tx,
            history: PerformanceHistory::new(),
        }
    }

    #[test]
    fn lower_latency_wins_under_heuristic() {
        let mut fast = entry("fast");
        fast.telemetry.latency_ms = 5.0;
        let mut slow = entry("slow");
        slow.telemetry.latency_ms = 80.0;

        let chosen = select(
            [&fast, &slow].into_iter(),
            "physics",
            &Constraints::default(),
            &[],
            10,
            0,
        );
        assert_eq!(chosen, Some("fast"));
    }

    #[test]
    fn load_and_reputation_penalties_apply() {
        let mut loaded = entry("loaded");
        loaded.in_flight = 1;
        let idle = entry("idle");
        // 15 points of load penalty beat equal latency.
        assert!(heuristic_score(&loaded) > heuristic_score(&idle));

        let mut disgraced = entry("disgraced");
        disgraced.reputation = 0.2;
        assert!(heuristic_score(&disgraced) > heuristic_score(&idle));
    }

    #[test]
    fn tried_peers_are_skipped_when_alternatives_exist() {
        let a = entry("peer_a");
        let b = entry("peer_b");

        let chosen = select(
            [&a, &b].into_iter(),
            "physics",
            &Constraints::default(),
            &["peer_a".to_string()],
            10,
            0,
        );
        assert_eq!(chosen, Some("peer_b"));

        // With every peer tried, selection falls back to the full set.
        let chosen = select(
            [&a].into_iter(),
            "physics",
            &Constraints::default(),
            &["peer_a".to_string()],
            10,
            0,
        );
        assert_eq!(chosen, Some("peer_a"));
    }

    #[test]
    fn full_peers_are_not_candidates() {
        let mut full = entry("full");
        full.in_flight = 2;

        let chosen = select(
            [&full].into_iter(),
            "physics",
            &Constraints::default(),
            &[],
            10,
            0,
        );
        assert_eq!(chosen, None);
    }

    #[test]
    fn selection_is_deterministic_on_equal_scores() {
        let a = entry("peer_a");
        let b = entry("peer_b");

        let first = select(
            [&a, &b].into_iter(),
            "physics",
            &Constraints::default(),
            &[],
            10,
            0,
        )
        .unwrap()
        .to_string();

        for _ in 0..10 {
            // Same state in any iteration order picks the same peer.
            let again = select(
                [&b, &a].into_iter(),
                "physics",
                &Constraints::default(),
                &[],
                10,
                0,
            )
            .unwrap();
            assert_eq!(again, first);
        }
    }

    #[test]
    fn learned_score_prefers_historically_fast_peer() {
        let mut proven_fast = entry("proven_fast");
        for _ in 0..20 {
            proven_fast
                .history
                .record_completion("physics", 10.0, true);
        }
        // Same reported latency, but this peer's history says ~300ms.
        let mut proven_slow = entry("proven_slow");
        for _ in 0..20 {
            proven_slow
                .history
                .record_completion("physics", 300.0, true);
        }

        let chosen = select(
            [&proven_slow, &proven_fast].into_iter(),
            "physics",
            &Constraints::default(),
            &[],
            10,
            0,
        );
        assert_eq!(chosen, Some("proven_fast"));
    }

    #[test]
    fn failure_prone_history_raises_learned_score() {
        let mut flaky = entry("flaky");
        for i in 0..20 {
            flaky
                .history
                .record_completion("physics", 10.0, i % 2 == 0);
        }
        let mut reliable = entry("reliable");
        for _ in 0..20 {
            reliable.history.record_completion("physics", 10.0, true);
        }

        let flaky_score = score(&flaky, "physics", 0, 10);
        let reliable_score = score(&reliable, "physics", 0, 10);
        assert!(flaky_score > reliable_score);
    }
}
