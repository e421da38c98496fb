//! # Scheduler & Failover Controller
//!
//! Drives every task through its lifecycle: admission (cache lookup,
//! single-flight, queue bound), peer selection, assignment, deadline
//! enforcement, retry on failure and terminal delivery to the submitting
//! renter.
//!
//! ## Failover
//!
//! On any failure, timeout or peer-down event affecting an assigned task, the
//! owning peer is freed and penalized, and the task is re-queued for an
//! immediate re-selection (after a 10ms backoff) as long as both the attempt
//! budget and the deadline allow. Previously tried peers are avoided unless
//! no alternative satisfies the constraints. Otherwise the task fails
//! terminally with a concise reason.
//!
//! ## Delivery guarantee
//!
//! [`TaskTable::finalize`] is single-shot per task, so the renter sees at
//! most one of `result_delivery` / `task_timeout` regardless of how many
//! events race at the end of a task's life.
//!
//! The scheduler is a cheap-to-clone handle: every field is shared, so
//! background timers and dispatch tasks clone it freely.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, RwLock};

use crate::common::messages::{now_ts, Constraints, Envelope, Message, Telemetry};
use crate::coordinator::cache::{task_digest, Admission, ResultCache};
use crate::coordinator::config::CoordinatorConfig;
use crate::coordinator::registry::{PeerRegistry, ReleaseOutcome};
use crate::coordinator::storage::Storage;
use crate::coordinator::tasks::{Task, TaskState, TaskTable};
use crate::error::TaskErrorKind;
use crate::peer::executors;

/// Pause before re-selecting a peer for a reclaimed task.
const FAILOVER_BACKOFF: Duration = Duration::from_millis(10);

/// Connected renters, keyed by client id, each holding the serialized writer
/// channel of its connection.
pub struct RenterDirectory {
    renters: RwLock<HashMap<String, mpsc::Sender<Envelope>>>,
}

impl RenterDirectory {
    pub fn new() -> Self {
        Self {
            renters: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, client_id: &str, sender: mpsc::Sender<Envelope>) {
        self.renters
            .write()
            .await
            .insert(client_id.to_string(), sender);
    }

    pub async fn unregister(&self, client_id: &str) {
        self.renters.write().await.remove(client_id);
    }

    pub async fn len(&self) -> usize {
        self.renters.read().await.len()
    }

    /// Deliver a message to a renter; silently dropped if it disconnected.
    pub async fn send(&self, client_id: &str, envelope: Envelope) {
        let sender = {
            let renters = self.renters.read().await;
            renters.get(client_id).cloned()
        };
        match sender {
            Some(tx) => {
                if tx.send(envelope).await.is_err() {
                    debug!("📪 Renter {} channel closed, message dropped", client_id);
                }
            }
            None => debug!("📪 Renter {} not connected, message dropped", client_id),
        }
    }
}

impl Default for RenterDirectory {
    fn default() -> Self {
        Self::new()
    }
}

/// What went wrong with one assignment attempt.
enum AttemptFailure {
    /// The peer reported a non-success result.
    PeerError(Option<String>),
    /// The per-task deadline fired.
    Timeout,
    /// The assignment could not be delivered to the peer.
    SendFailed,
}

/// Task lifecycle engine shared by all connection handlers.
///
/// All fields are shared state, so cloning produces another handle onto the
/// same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    config: CoordinatorConfig,
    registry: Arc<PeerRegistry>,
    tasks: Arc<TaskTable>,
    cache: Arc<ResultCache>,
    storage: Option<Arc<Storage>>,
    renters: Arc<RenterDirectory>,
    tasks_routed: Arc<AtomicU64>,
    revenue_usd: Arc<Mutex<f64>>,
}

impl Scheduler {
    pub fn new(
        config: CoordinatorConfig,
        registry: Arc<PeerRegistry>,
        tasks: Arc<TaskTable>,
        cache: Arc<ResultCache>,
        storage: Option<Arc<Storage>>,
        renters: Arc<RenterDirectory>,
    ) -> Self {
        Self {
            config,
            registry,
            tasks,
            cache,
            storage,
            renters,
            tasks_routed: Arc::new(AtomicU64::new(0)),
            revenue_usd: Arc::new(Mutex::new(0.0)),
        }
    }

    // ========================================================================
    // SUBMIT PATH
    // ========================================================================

    /// Admit one submitted task: reject unknown types and queue overflow
    /// synchronously, serve cache hits without scheduling, deduplicate
    /// concurrent identical submits, and otherwise queue + assign.
    #[allow(clippy::too_many_arguments)]
    pub async fn submit(
        &self,
        task_id: String,
        job_id: Option<String>,
        task_type: String,
        data: Vec<u8>,
        params: BTreeMap<String, serde_json::Value>,
        priority: i32,
        deadline_ms: Option<u64>,
        constraints: Constraints,
        requester_id: String,
    ) {
        if !executors::is_known_type(&task_type) {
            warn!(
                "✗ Rejected task {} with unknown type '{}'",
                task_id, task_type
            );
            self.deliver_failure(&requester_id, &task_id, TaskErrorKind::UnknownTaskType, None)
                .await;
            return;
        }

        let digest = task_digest(&task_type, &data, &params);

        match self.cache.admit(&digest, &task_id, &requester_id) {
            Admission::CacheHit(hit) => {
                info!("📦 Cache hit for task {} ({})", task_id, task_type);
                self.deliver_cached_success(
                    &requester_id,
                    &task_id,
                    hit.result,
                    hit.processing_time_ms,
                )
                .await;
                return;
            }
            Admission::Follower => {
                debug!(
                    "🔁 Task {} attached to in-flight computation {}",
                    task_id,
                    &digest[..12]
                );
                return;
            }
            Admission::Leader => {}
        }

        // Restart warm-up: a miss in memory may still hit persisted results.
        if let Some(storage) = &self.storage {
            if let Some((result, processing_time_ms)) = storage.cached_result(&task_type, &digest)
            {
                info!("📦 Stored result hit for task {} ({})", task_id, task_type);
                for follower in self
                    .cache
                    .complete_flight(&digest, Some((&result, processing_time_ms)))
                {
                    self.deliver_cached_success(
                        &follower.requester_id,
                        &follower.task_id,
                        result.clone(),
                        processing_time_ms,
                    )
                    .await;
                }
                self.deliver_cached_success(&requester_id, &task_id, result, processing_time_ms)
                    .await;
                return;
            }
        }

        let task = Task {
            task_id: task_id.clone(),
            job_id: job_id.unwrap_or_else(|| task_id.clone()),
            task_type: task_type.clone(),
            data,
            params,
            deadline_ms: deadline_ms.unwrap_or(self.config.default_deadline_ms),
            priority,
            constraints,
            submitted_at: now_ts(),
            attempts: 0,
        };

        if let Err(kind) = self.tasks.insert_queued(task, &requester_id, &digest).await {
            warn!("✗ Submit queue full, rejecting task {}", task_id);
            for follower in self.cache.abort_flight(&digest) {
                self.deliver_failure(
                    &follower.requester_id,
                    &follower.task_id,
                    kind.clone(),
                    None,
                )
                .await;
            }
            self.deliver_failure(&requester_id, &task_id, kind, None)
                .await;
            return;
        }

        if let Some(storage) = &self.storage {
            let _ = storage.store_task(&task_id, &requester_id, &task_type, &digest);
        }

        // One deadline timer per task, covering its whole life: the deadline
        // is a total budget from submission, whether the task is waiting in
        // the queue or out on a peer.
        let scheduler = self.clone();
        let timer_task_id = task_id.clone();
        let deadline =
            Duration::from_millis(deadline_ms.unwrap_or(self.config.default_deadline_ms));
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            scheduler.handle_deadline(&timer_task_id).await;
        });

        self.try_assign(&task_id).await;
    }

    // ========================================================================
    // ASSIGNMENT
    // ========================================================================

    /// Pick a peer for a queued task and hand the task over.
    ///
    /// When every eligible peer is at capacity the task simply stays queued;
    /// the next freed slot (or newly registered peer) triggers a dispatch.
    /// Only a task no registered peer could ever satisfy fails fast with
    /// `no_peers`.
    pub async fn try_assign(&self, task_id: &str) {
        let view = match self.tasks.assignment_view(task_id).await {
            Some(v) => v,
            // Completed, failed or reclaimed concurrently; nothing to do.
            None => return,
        };

        if view.task.deadline_expired() {
            self.finalize_failure(task_id, TaskErrorKind::Timeout, None)
                .await;
            return;
        }

        let acquired = self
            .registry
            .acquire_peer(
                task_id,
                &view.task.task_type,
                &view.task.constraints,
                &view.tried_peers,
                self.config.min_training_samples,
            )
            .await;

        let (peer_id, sender) = match acquired {
            Some(pair) => pair,
            None => {
                if self.registry.any_eligible(&view.task.constraints).await {
                    debug!("⏸️  Task {} waiting for peer capacity", task_id);
                } else {
                    self.finalize_failure(task_id, TaskErrorKind::NoPeers, None)
                        .await;
                }
                return;
            }
        };

        let attempt = match self.tasks.mark_assigned(task_id, &peer_id).await {
            Some(n) => n,
            None => {
                // Task left the queue while we reserved the slot; roll back.
                self.registry
                    .release(&peer_id, task_id, ReleaseOutcome::Detach)
                    .await;
                return;
            }
        };

        info!("📌 Task {} → {} (attempt {})", task_id, peer_id, attempt);
        self.tasks_routed.fetch_add(1, Ordering::Relaxed);
        if let Some(storage) = &self.storage {
            let _ = storage.assign_task(task_id, &peer_id);
        }

        let assign = Envelope::new(Message::TaskAssign {
            task_id: task_id.to_string(),
            task_type: view.task.task_type.clone(),
            data: view.task.data.clone(),
            params: view.task.params.clone(),
        });
        if sender.send(assign).await.is_err() {
            warn!("❌ Failed to hand task {} to {}", task_id, peer_id);
            self.attempt_failed(task_id, &peer_id, AttemptFailure::SendFailed)
                .await;
        }
    }

    /// Offer every queued task a chance to run, highest priority first.
    /// Called whenever capacity appears: a slot freed or a peer registered.
    pub async fn dispatch_queued(&self) {
        for task_id in self.tasks.queued_ids().await {
            self.try_assign(&task_id).await;
        }
    }

    /// Schedule a queue dispatch after a short delay.
    fn kick_queue(&self, delay: Duration) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.dispatch_queued().await;
        });
    }

    /// Deadline timer callback: the task's total budget is spent.
    async fn handle_deadline(&self, task_id: &str) {
        match self.tasks.state_of(task_id).await {
            Some(TaskState::Assigned { peer_id }) => {
                warn!("⏰ Task {} deadline elapsed on {}", task_id, peer_id);
                self.attempt_failed(task_id, &peer_id, AttemptFailure::Timeout)
                    .await;
            }
            Some(TaskState::Queued) => {
                warn!("⏰ Task {} deadline elapsed while queued", task_id);
                self.finalize_failure(task_id, TaskErrorKind::Timeout, None)
                    .await;
            }
            _ => {}
        }
    }

    // ========================================================================
    // RESULT & FAILURE HANDLING
    // ========================================================================

    /// Process a `task_result` frame from a peer.
    pub async fn handle_task_result(
        &self,
        task_id: &str,
        peer_id: &str,
        success: bool,
        result: Vec<u8>,
        processing_time_ms: f64,
        error: Option<String>,
    ) {
        let state = match self.tasks.state_of(task_id).await {
            Some(s) => s,
            None => {
                warn!("Received result for unknown task: {}", task_id);
                return;
            }
        };
        if state.is_terminal() {
            debug!("🗑️  Late result for task {} dropped", task_id);
            return;
        }

        if success {
            // Accepted idempotently even if the task was reclaimed from this
            // peer in the meantime (the recorded status is still open).
            self.finalize_success(task_id, peer_id, result, processing_time_ms)
                .await;
        } else {
            match state {
                TaskState::Assigned { peer_id: owner } if owner == peer_id => {
                    info!(
                        "✗ Task {} failed on {}: {}",
                        task_id,
                        peer_id,
                        error.as_deref().unwrap_or("unspecified")
                    );
                    self.attempt_failed(task_id, peer_id, AttemptFailure::PeerError(error))
                        .await;
                }
                _ => debug!(
                    "🗑️  Stale failure for task {} from {} dropped",
                    task_id, peer_id
                ),
            }
        }
    }

    /// Reclaim everything assigned to a dead peer and remove it.
    pub async fn handle_peer_down(&self, peer_id: &str, reason: &str) {
        if !self.registry.unregister(peer_id, reason).await {
            return;
        }
        self.reclaim_orphans(peer_id, reason).await;
    }

    /// Like [`Self::handle_peer_down`], but only if the peer still belongs to
    /// the given transport session.
    pub async fn handle_peer_disconnect(&self, peer_id: &str, session: u64, reason: &str) {
        if !self
            .registry
            .unregister_if_session(peer_id, session, reason)
            .await
        {
            return;
        }
        self.reclaim_orphans(peer_id, reason).await;
    }

    async fn reclaim_orphans(&self, peer_id: &str, reason: &str) {
        if let Some(storage) = &self.storage {
            let _ = storage.deactivate_peer(peer_id);
        }
        let event = Message::PeerDisconnect {
            peer_id: peer_id.to_string(),
            reason: reason.to_string(),
        };
        debug!("🔌 {:?}", event);

        let orphaned = self.tasks.assigned_to(peer_id).await;
        if !orphaned.is_empty() {
            warn!(
                "🗑️  Reclaiming {} task(s) from departed peer {}",
                orphaned.len(),
                peer_id
            );
        }
        for task_id in orphaned {
            // The peer entry is already gone, so there is no slot to free;
            // only the task side is reclaimed here.
            if self
                .tasks
                .detach_assignment(&task_id, peer_id)
                .await
                .is_none()
            {
                continue;
            }
            self.requeue_or_fail(&task_id, TaskErrorKind::PeerError, Some(reason.to_string()))
                .await;
        }
    }

    /// Shared failure path for one assignment attempt: free the peer with the
    /// right penalty, then retry or fail terminally.
    async fn attempt_failed(&self, task_id: &str, peer_id: &str, failure: AttemptFailure) {
        let detach = match self.tasks.detach_assignment(task_id, peer_id).await {
            Some(d) => d,
            // Another event (late success, concurrent timeout) won the race.
            None => return,
        };

        let elapsed_ms = detach
            .assigned_at
            .map(|t| (now_ts() - t) * 1000.0)
            .unwrap_or(0.0);
        self.registry
            .release(
                peer_id,
                task_id,
                ReleaseOutcome::Failure {
                    task_type: detach.task.task_type.clone(),
                    elapsed_ms,
                    repeat: detach.task.attempts > 1,
                },
            )
            .await;
        // The slot freed by this failure may unblock other queued tasks even
        // when this one fails terminally below.
        self.kick_queue(FAILOVER_BACKOFF);

        let (kind, detail) = match failure {
            AttemptFailure::Timeout => (TaskErrorKind::Timeout, None),
            AttemptFailure::PeerError(detail) => (TaskErrorKind::PeerError, detail),
            AttemptFailure::SendFailed => {
                (TaskErrorKind::PeerError, Some("send_failed".to_string()))
            }
        };

        if matches!(kind, TaskErrorKind::Timeout) {
            // The deadline is a total budget from submission; once it fires
            // there is nothing left to retry with.
            self.finalize_failure(task_id, TaskErrorKind::Timeout, None)
                .await;
            return;
        }

        self.requeue_or_fail(task_id, kind, detail).await;
    }

    /// Retry a reclaimed (queued) task if attempts and deadline allow,
    /// otherwise fail it terminally with the bounding reason.
    async fn requeue_or_fail(&self, task_id: &str, kind: TaskErrorKind, detail: Option<String>) {
        let attempts = self.tasks.attempts_of(task_id).await.unwrap_or(0);
        let view = match self.tasks.assignment_view(task_id).await {
            Some(v) => v,
            None => return,
        };

        if attempts >= self.config.max_attempts {
            self.finalize_failure(task_id, TaskErrorKind::ExhaustedAttempts, detail)
                .await;
            return;
        }
        if view.task.deadline_expired() {
            self.finalize_failure(task_id, TaskErrorKind::Timeout, None)
                .await;
            return;
        }

        debug!(
            "🔄 Requeueing task {} after {:?} (attempt {}/{})",
            task_id, kind, attempts, self.config.max_attempts
        );
        // The whole queue is dispatched rather than just this task, so the
        // re-selection cannot starve older waiting work.
        self.kick_queue(FAILOVER_BACKOFF);
    }

    /// Complete a task: record stats and billing, write through the cache,
    /// release the producing peer and deliver to the renter and any
    /// single-flight followers.
    async fn finalize_success(
        &self,
        task_id: &str,
        from_peer: &str,
        result: Vec<u8>,
        processing_time_ms: f64,
    ) {
        let info = match self.tasks.finalize(task_id, true).await {
            Some(i) => i,
            None => return,
        };

        let elapsed_ms = info
            .assigned_at
            .map(|t| (now_ts() - t) * 1000.0)
            .unwrap_or(processing_time_ms);

        match info.assigned_peer.as_deref() {
            Some(owner) if owner == from_peer => {
                self.registry
                    .release(
                        from_peer,
                        task_id,
                        ReleaseOutcome::Success {
                            task_type: info.task.task_type.clone(),
                            elapsed_ms,
                        },
                    )
                    .await;
            }
            Some(other) => {
                // A late result from a previous attempt completed the task
                // while a newer assignment was still running; free that slot
                // without judging the newer peer.
                self.registry
                    .release(other, task_id, ReleaseOutcome::Detach)
                    .await;
            }
            None => {}
        }

        let cost_usd = self.config.task_cost_usd(processing_time_ms);
        let earning = self.config.peer_earning_usd(processing_time_ms);
        let fee = cost_usd * self.config.coordinator_fee;
        *self.revenue_usd.lock().unwrap() += fee;

        if let Some(storage) = &self.storage {
            let _ = storage.store_result(task_id, &result, processing_time_ms, cost_usd);
            let _ = storage.update_peer_earnings(from_peer, earning);
            let _ = storage.update_gamer_spending(&info.requester_id, cost_usd);
        }

        info!(
            "✓ Task {} completed by {} in {:.1}ms (${:.6})",
            task_id, from_peer, processing_time_ms, cost_usd
        );

        let followers = self
            .cache
            .complete_flight(&info.digest, Some((&result, processing_time_ms)));
        for follower in followers {
            self.deliver_cached_success(
                &follower.requester_id,
                &follower.task_id,
                result.clone(),
                processing_time_ms,
            )
            .await;
        }

        self.renters
            .send(
                &info.requester_id,
                Envelope::new(Message::ResultDelivery {
                    task_id: task_id.to_string(),
                    success: true,
                    result,
                    processing_time_ms,
                    error: None,
                    cached: false,
                    cost_usd,
                }),
            )
            .await;

        // A peer slot just freed up; offer it to waiting work.
        self.kick_queue(Duration::from_millis(0));
    }

    /// Fail a task terminally and deliver the single terminal event, plus the
    /// same outcome to any single-flight followers.
    async fn finalize_failure(&self, task_id: &str, kind: TaskErrorKind, detail: Option<String>) {
        let info = match self.tasks.finalize(task_id, false).await {
            Some(i) => i,
            None => return,
        };

        if let Some(peer_id) = info.assigned_peer.as_deref() {
            // Terminal failure decided while an assignment was outstanding.
            self.registry
                .release(peer_id, task_id, ReleaseOutcome::Detach)
                .await;
            self.kick_queue(Duration::from_millis(0));
        }

        if let Some(storage) = &self.storage {
            let _ = storage.fail_task(task_id, &kind.to_string());
        }

        warn!(
            "✗ Task {} failed terminally: {}{}",
            task_id,
            kind,
            detail
                .as_deref()
                .map(|d| format!(" ({})", d))
                .unwrap_or_default()
        );

        for follower in self.cache.complete_flight(&info.digest, None) {
            self.deliver_failure(
                &follower.requester_id,
                &follower.task_id,
                kind.clone(),
                detail.clone(),
            )
            .await;
        }
        self.deliver_failure(&info.requester_id, task_id, kind, detail)
            .await;
    }

    // ========================================================================
    // HEARTBEATS & DELIVERY HELPERS
    // ========================================================================

    /// Record a peer heartbeat.
    pub async fn handle_heartbeat(&self, peer_id: &str, load: f64, telemetry: Telemetry) {
        if !self.registry.heartbeat(peer_id, load, telemetry).await {
            debug!("💓 Heartbeat from unregistered peer {}", peer_id);
        }
    }

    async fn deliver_cached_success(
        &self,
        requester_id: &str,
        task_id: &str,
        result: Vec<u8>,
        processing_time_ms: f64,
    ) {
        self.renters
            .send(
                requester_id,
                Envelope::new(Message::ResultDelivery {
                    task_id: task_id.to_string(),
                    success: true,
                    result,
                    processing_time_ms,
                    error: None,
                    cached: true,
                    cost_usd: 0.0,
                }),
            )
            .await;
    }

    /// Map a failure kind onto the right wire message: deadline-style
    /// failures become `task_timeout`, everything else a failed
    /// `result_delivery`.
    async fn deliver_failure(
        &self,
        requester_id: &str,
        task_id: &str,
        kind: TaskErrorKind,
        detail: Option<String>,
    ) {
        let msg = match kind {
            TaskErrorKind::Timeout | TaskErrorKind::ExhaustedAttempts => Message::TaskTimeout {
                task_id: task_id.to_string(),
                error: kind.to_string(),
            },
            _ => Message::ResultDelivery {
                task_id: task_id.to_string(),
                success: false,
                result: Vec::new(),
                processing_time_ms: 0.0,
                error: Some(match detail {
                    Some(d) => format!("{}: {}", kind, d),
                    None => kind.to_string(),
                }),
                cached: false,
                cost_usd: 0.0,
            },
        };
        self.renters.send(requester_id, Envelope::new(msg)).await;
    }

    // ========================================================================
    // INTROSPECTION (stats loop and tests)
    // ========================================================================

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn tasks(&self) -> &Arc<TaskTable> {
        &self.tasks
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn storage(&self) -> Option<&Arc<Storage>> {
        self.storage.as_ref()
    }

    pub fn renters(&self) -> &Arc<RenterDirectory> {
        &self.renters
    }

    /// Number of assignments handed to peers since startup.
    pub fn tasks_routed(&self) -> u64 {
        self.tasks_routed.load(Ordering::Relaxed)
    }

    /// Accumulated coordinator fees.
    pub fn revenue_usd(&self) -> f64 {
        *self.revenue_usd.lock().unwrap()
    }
}
