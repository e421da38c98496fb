//! # Task Table & Lifecycle
//!
//! Holds every task the coordinator knows about, keyed by `task_id`, and
//! enforces the lifecycle state machine:
//!
//! ```text
//!         submit
//!    ───────────────▶  QUEUED
//!                       │
//!                       │ assign(peer)
//!                       ▼
//!                    ASSIGNED ──timeout/failure/peer_down──▶ QUEUED or FAILED
//!                       │
//!                       │ success
//!                       ▼
//!                    COMPLETED
//! ```
//!
//! `COMPLETED` and `FAILED` are terminal. Transitions through this table are
//! the only place `attempts` changes, and [`TaskTable::finalize`] hands out
//! the single permission to deliver a terminal message per task.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::RwLock;

use crate::common::messages::{now_ts, Constraints};
use crate::error::TaskErrorKind;

/// One unit of opaque work, owned by the task table.
#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: String,
    /// Group key; used only for bookkeeping, never for scheduling
    pub job_id: String,
    pub task_type: String,
    pub data: Vec<u8>,
    pub params: BTreeMap<String, serde_json::Value>,
    /// Total time budget measured from submission
    pub deadline_ms: u64,
    pub priority: i32,
    pub constraints: Constraints,
    pub submitted_at: f64,
    pub attempts: u32,
}

impl Task {
    /// Whether the task's total deadline has elapsed.
    pub fn deadline_expired(&self) -> bool {
        (now_ts() - self.submitted_at) * 1000.0 >= self.deadline_ms as f64
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Assigned { peer_id: String },
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

/// Table entry: the task plus scheduling bookkeeping.
struct TaskEntry {
    task: Task,
    state: TaskState,
    requester_id: String,
    digest: String,
    tried_peers: Vec<String>,
    assigned_at: Option<f64>,
}

/// Everything the scheduler needs to deliver a terminal event for a task.
pub struct FinalizeInfo {
    pub task: Task,
    pub requester_id: String,
    pub digest: String,
    /// Peer the task was assigned to at finalize time, if any
    pub assigned_peer: Option<String>,
    pub assigned_at: Option<f64>,
}

/// Snapshot handed to the scheduler for an assignment attempt.
pub struct AssignmentView {
    pub task: Task,
    pub tried_peers: Vec<String>,
}

/// Snapshot returned when an assignment is reclaimed from a peer.
pub struct DetachInfo {
    pub task: Task,
    pub assigned_at: Option<f64>,
}

/// Task table with a bounded submit queue.
pub struct TaskTable {
    inner: RwLock<Inner>,
    queue_capacity: usize,
}

struct Inner {
    entries: HashMap<String, TaskEntry>,
    /// Count of tasks currently in `Queued`
    queued: usize,
    completed: u64,
    failed: u64,
}

impl TaskTable {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                queued: 0,
                completed: 0,
                failed: 0,
            }),
            queue_capacity,
        }
    }

    /// Insert a freshly submitted task in `QUEUED`. Fails with `queue_full`
    /// when the bounded submit queue is at capacity.
    pub async fn insert_queued(
        &self,
        task: Task,
        requester_id: &str,
        digest: &str,
    ) -> Result<(), TaskErrorKind> {
        let mut inner = self.inner.write().await;
        if inner.queued >= self.queue_capacity {
            return Err(TaskErrorKind::QueueFull);
        }
        inner.queued += 1;
        inner.entries.insert(
            task.task_id.clone(),
            TaskEntry {
                task,
                state: TaskState::Queued,
                requester_id: requester_id.to_string(),
                digest: digest.to_string(),
                tried_peers: Vec::new(),
                assigned_at: None,
            },
        );
        Ok(())
    }

    /// Task and tried-peer list for an assignment attempt; `None` unless the
    /// task is a schedulable `QUEUED` entry.
    pub async fn assignment_view(&self, task_id: &str) -> Option<AssignmentView> {
        let inner = self.inner.read().await;
        let entry = inner.entries.get(task_id)?;
        if entry.state != TaskState::Queued {
            return None;
        }
        Some(AssignmentView {
            task: entry.task.clone(),
            tried_peers: entry.tried_peers.clone(),
        })
    }

    /// Transition `QUEUED → ASSIGNED` on a peer. Increments `attempts` and
    /// returns the new attempt number. Returns `None` if the task is no
    /// longer queued (the caller must then roll back its peer reservation).
    pub async fn mark_assigned(&self, task_id: &str, peer_id: &str) -> Option<u32> {
        let mut inner = self.inner.write().await;
        let entry = inner.entries.get_mut(task_id)?;
        if entry.state != TaskState::Queued {
            return None;
        }
        entry.state = TaskState::Assigned {
            peer_id: peer_id.to_string(),
        };
        entry.task.attempts += 1;
        entry.tried_peers.push(peer_id.to_string());
        entry.assigned_at = Some(now_ts());
        let attempt = entry.task.attempts;
        inner.queued -= 1;
        Some(attempt)
    }

    /// Reclaim: `ASSIGNED → QUEUED`, but only while the task is still
    /// assigned to `expected_peer`.
    ///
    /// Concurrent failure events for the same assignment (deadline timer vs.
    /// peer error vs. peer disconnect) all race through here, and exactly one
    /// wins; the losers see `None` and must not touch the peer's slot.
    pub async fn detach_assignment(
        &self,
        task_id: &str,
        expected_peer: &str,
    ) -> Option<DetachInfo> {
        let mut inner = self.inner.write().await;
        let entry = inner.entries.get_mut(task_id)?;
        match &entry.state {
            TaskState::Assigned { peer_id } if peer_id == expected_peer => {}
            _ => return None,
        }
        entry.state = TaskState::Queued;
        let assigned_at = entry.assigned_at.take();
        let info = DetachInfo {
            task: entry.task.clone(),
            assigned_at,
        };
        inner.queued += 1;
        Some(info)
    }

    /// Transition to a terminal state, exactly once.
    ///
    /// Returns the delivery info on the first call and `None` on any later
    /// call, which is what guarantees at most one terminal message per task.
    pub async fn finalize(&self, task_id: &str, success: bool) -> Option<FinalizeInfo> {
        let mut inner = self.inner.write().await;

        let was_queued = match inner.entries.get(task_id) {
            Some(e) if e.state.is_terminal() => return None,
            Some(e) => e.state == TaskState::Queued,
            None => return None,
        };
        if was_queued {
            inner.queued -= 1;
        }
        if success {
            inner.completed += 1;
        } else {
            inner.failed += 1;
        }

        let entry = inner.entries.get_mut(task_id).expect("entry just seen");
        let assigned_peer = match &entry.state {
            TaskState::Assigned { peer_id } => Some(peer_id.clone()),
            _ => None,
        };
        entry.state = if success {
            TaskState::Completed
        } else {
            TaskState::Failed
        };
        Some(FinalizeInfo {
            task: entry.task.clone(),
            requester_id: entry.requester_id.clone(),
            digest: entry.digest.clone(),
            assigned_peer,
            assigned_at: entry.assigned_at,
        })
    }

    /// Current state of a task.
    pub async fn state_of(&self, task_id: &str) -> Option<TaskState> {
        self.inner
            .read()
            .await
            .entries
            .get(task_id)
            .map(|e| e.state.clone())
    }

    /// Attempt counter of a task.
    pub async fn attempts_of(&self, task_id: &str) -> Option<u32> {
        self.inner
            .read()
            .await
            .entries
            .get(task_id)
            .map(|e| e.task.attempts)
    }

    /// All tasks currently assigned to one peer.
    pub async fn assigned_to(&self, peer_id: &str) -> Vec<String> {
        self.inner
            .read()
            .await
            .entries
            .iter()
            .filter(|(_, e)| {
                matches!(&e.state, TaskState::Assigned { peer_id: p } if p == peer_id)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn queued_count(&self) -> usize {
        self.inner.read().await.queued
    }

    /// Ids of every queued task, higher priority first, then submission
    /// order. This is the dispatch order when peer capacity frees up.
    pub async fn queued_ids(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut queued: Vec<(&String, i32, f64)> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.state == TaskState::Queued)
            .map(|(id, e)| (id, e.task.priority, e.task.submitted_at))
            .collect();
        queued.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.total_cmp(&b.2)));
        queued.into_iter().map(|(id, _, _)| id.clone()).collect()
    }

    /// (completed, failed) totals since startup.
    pub async fn terminal_counts(&self) -> (u64, u64) {
        let inner = self.inner.read().await;
        (inner.completed, inner.failed)
    }

    /// Count of tasks in `ASSIGNED`, for the peer-accounting invariant.
    pub async fn assigned_count(&self) -> usize {
        self.inner
            .read()
            .await
            .entries
            .values()
            .filter(|e| matches!(e.state, TaskState::Assigned { .. }))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(task_id: &str) -> Task {
        Task {
            task_id: task_id.to_string(),
            job_id: "job_1".to_string(),
            task_type: "physics".to_string(),
            data: vec![1, 2, 3],
            params: BTreeMap::new(),
            deadline_ms: 5_000,
            priority: 0,
            constraints: Constraints::default(),
            submitted_at: now_ts(),
            attempts: 0,
        }
    }

    #[tokio::test]
    async fn lifecycle_happy_path() {
        let table = TaskTable::new(10);
        table
            .insert_queued(task("t1"), "gamer_1", "digest_1")
            .await
            .unwrap();
        assert_eq!(table.state_of("t1").await, Some(TaskState::Queued));
        assert_eq!(table.queued_count().await, 1);

        let attempt = table.mark_assigned("t1", "peer_1").await.unwrap();
        assert_eq!(attempt, 1);
        assert_eq!(table.queued_count().await, 0);
        assert_eq!(table.assigned_count().await, 1);

        let info = table.finalize("t1", true).await.unwrap();
        assert_eq!(info.assigned_peer.as_deref(), Some("peer_1"));
        assert_eq!(table.state_of("t1").await, Some(TaskState::Completed));
    }

    #[tokio::test]
    async fn attempts_change_only_through_assignment() {
        let table = TaskTable::new(10);
        table
            .insert_queued(task("t1"), "gamer_1", "d")
            .await
            .unwrap();
        assert_eq!(table.attempts_of("t1").await, Some(0));

        table.mark_assigned("t1", "peer_1").await.unwrap();
        assert_eq!(table.attempts_of("t1").await, Some(1));

        assert!(table.detach_assignment("t1", "peer_1").await.is_some());
        assert_eq!(table.attempts_of("t1").await, Some(1));

        table.mark_assigned("t1", "peer_2").await.unwrap();
        assert_eq!(table.attempts_of("t1").await, Some(2));
    }

    #[tokio::test]
    async fn finalize_is_single_shot() {
        let table = TaskTable::new(10);
        table
            .insert_queued(task("t1"), "gamer_1", "d")
            .await
            .unwrap();
        table.mark_assigned("t1", "peer_1").await.unwrap();

        assert!(table.finalize("t1", false).await.is_some());
        // A late result must not produce a second terminal event.
        assert!(table.finalize("t1", true).await.is_none());
        assert_eq!(table.state_of("t1").await, Some(TaskState::Failed));
    }

    #[tokio::test]
    async fn queue_capacity_rejects_overflow() {
        let table = TaskTable::new(2);
        table
            .insert_queued(task("t1"), "g", "d1")
            .await
            .unwrap();
        table
            .insert_queued(task("t2"), "g", "d2")
            .await
            .unwrap();
        let err = table
            .insert_queued(task("t3"), "g", "d3")
            .await
            .unwrap_err();
        assert_eq!(err, TaskErrorKind::QueueFull);

        // Assignment frees a queue slot for the next submit.
        table.mark_assigned("t1", "peer_1").await.unwrap();
        table
            .insert_queued(task("t4"), "g", "d4")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn detach_requires_the_owning_peer_and_wins_once() {
        let table = TaskTable::new(1);
        table
            .insert_queued(task("t1"), "g", "d1")
            .await
            .unwrap();
        table.mark_assigned("t1", "peer_1").await.unwrap();
        assert_eq!(table.queued_count().await, 0);

        // A stale event naming the wrong peer loses the race.
        assert!(table.detach_assignment("t1", "peer_9").await.is_none());

        assert!(table.detach_assignment("t1", "peer_1").await.is_some());
        assert_eq!(table.queued_count().await, 1);
        assert_eq!(table.assigned_to("peer_1").await.len(), 0);
        // Second detach for the same assignment finds nothing to reclaim.
        assert!(table.detach_assignment("t1", "peer_1").await.is_none());

        // Re-assignment works after a reclaim.
        assert!(table.mark_assigned("t1", "peer_2").await.is_some());
        assert_eq!(table.assigned_to("peer_2").await, vec!["t1".to_string()]);
    }
}
