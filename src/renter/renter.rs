//! # Renter Client
//!
//! The renter (gamer) side of the network: connect, register, submit tasks
//! and collect results as they arrive.
//!
//! Submission is non-blocking: [`RenterClient::submit`] sends `task_submit`
//! and returns a [`TaskHandle`] immediately. Results are delivered
//! asynchronously and may arrive in any order across outstanding task ids;
//! each handle resolves exactly once, with the terminal outcome or with
//! `transport_closed` if the connection drops first. A callback can be
//! registered instead of awaiting a handle, and [`RenterClient::assemble_stream`]
//! reassembles collected outputs in caller-supplied order. Compound tasks can
//! be decomposed client-side with [`RenterClient::submit_split`] before they
//! ever reach the coordinator.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use log::{debug, error, info};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::common::connection::Connection;
use crate::common::messages::{Constraints, Envelope, Message};
use crate::coordinator::tasks::Task;
use crate::error::TaskErrorKind;
use crate::splitter::HybridSplitter;

/// Terminal outcome of one submitted task, as seen by the renter.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: String,
    pub success: bool,
    pub result: Vec<u8>,
    pub processing_time_ms: f64,
    pub error: Option<String>,
    /// Served from the result cache or a deduplicated computation
    pub cached: bool,
    pub cost_usd: f64,
}

impl TaskOutcome {
    /// The boundary error kind, when the error string names one. Compound
    /// strings like `"peer_error: gpu fault"` parse by their leading reason.
    pub fn error_kind(&self) -> Option<TaskErrorKind> {
        let error = self.error.as_deref()?;
        let reason = error.split(':').next().unwrap_or(error).trim();
        TaskErrorKind::parse(reason)
    }
}

/// Optional per-submit settings.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub job_id: Option<String>,
    pub priority: i32,
    pub deadline_ms: Option<u64>,
    pub constraints: Constraints,
}

/// Awaitable handle for one submitted task. Resolves at most once.
pub struct TaskHandle {
    task_id: String,
    rx: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Wait for the terminal outcome.
    pub async fn await_result(self) -> Result<TaskOutcome> {
        self.rx
            .await
            .map_err(|_| anyhow!(TaskErrorKind::TransportClosed))
    }
}

enum Waiter {
    Handle(oneshot::Sender<TaskOutcome>),
    Callback(Box<dyn FnOnce(TaskOutcome) + Send>),
}

struct SharedState {
    pending: Mutex<HashMap<String, Waiter>>,
    results: Mutex<HashMap<String, TaskOutcome>>,
}

impl SharedState {
    fn resolve(&self, outcome: TaskOutcome) {
        self.results
            .lock()
            .unwrap()
            .insert(outcome.task_id.clone(), outcome.clone());
        let waiter = self.pending.lock().unwrap().remove(&outcome.task_id);
        match waiter {
            Some(Waiter::Handle(tx)) => {
                let _ = tx.send(outcome);
            }
            Some(Waiter::Callback(cb)) => cb(outcome),
            None => debug!("Result for unknown task {} dropped", outcome.task_id),
        }
    }

    /// Resolve every outstanding task with `transport_closed`.
    fn fail_all_pending(&self) {
        let drained: Vec<(String, Waiter)> =
            self.pending.lock().unwrap().drain().collect();
        for (task_id, waiter) in drained {
            let outcome = TaskOutcome {
                task_id: task_id.clone(),
                success: false,
                result: Vec::new(),
                processing_time_ms: 0.0,
                error: Some(TaskErrorKind::TransportClosed.to_string()),
                cached: false,
                cost_usd: 0.0,
            };
            self.results
                .lock()
                .unwrap()
                .insert(task_id, outcome.clone());
            match waiter {
                Waiter::Handle(tx) => {
                    let _ = tx.send(outcome);
                }
                Waiter::Callback(cb) => cb(outcome),
            }
        }
    }
}

/// Connected renter client.
pub struct RenterClient {
    client_id: String,
    tx: mpsc::Sender<Envelope>,
    state: Arc<SharedState>,
}

impl RenterClient {
    /// Connect to the coordinator and register. Fails if the coordinator
    /// rejects the registration or closes the connection.
    pub async fn connect(coord_addr: &str, client_id: &str) -> Result<Self> {
        info!("🎮 Connecting renter {} to {}", client_id, coord_addr);
        let stream = TcpStream::connect(coord_addr).await?;
        let mut conn = Connection::new(stream);

        conn.write_message(&Envelope::new(Message::GamerRegister {
            client_id: client_id.to_string(),
        }))
        .await?;

        match conn.read_message().await? {
            Some(Envelope {
                msg:
                    Message::GamerRegisterResponse {
                        success,
                        available_peers,
                        ..
                    },
                ..
            }) => {
                if !success {
                    bail!("coordinator rejected registration");
                }
                info!(
                    "✓ Registered as {} ({} peers available)",
                    client_id, available_peers
                );
            }
            _ => bail!("unexpected response during registration"),
        }

        let (reader, mut writer) = conn.into_split();
        let (tx, mut rx) = mpsc::channel::<Envelope>(64);
        let state = Arc::new(SharedState {
            pending: Mutex::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
        });

        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if writer.write_message(&envelope).await.is_err() {
                    break;
                }
            }
        });

        let reader_state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut reader = reader;
            loop {
                match reader.read_message().await {
                    Ok(Some(envelope)) => handle_delivery(&reader_state, envelope.msg),
                    Ok(None) => break,
                    Err(e) => {
                        error!("❌ Renter connection error: {}", e);
                        break;
                    }
                }
            }
            reader_state.fail_all_pending();
        });

        Ok(Self {
            client_id: client_id.to_string(),
            tx,
            state,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Submit a task; returns a handle resolving with its terminal outcome.
    pub async fn submit(
        &self,
        task_type: &str,
        data: Vec<u8>,
        params: BTreeMap<String, serde_json::Value>,
        opts: SubmitOptions,
    ) -> Result<TaskHandle> {
        let task_id = fresh_task_id();
        let (done_tx, done_rx) = oneshot::channel();
        self.state
            .pending
            .lock()
            .unwrap()
            .insert(task_id.clone(), Waiter::Handle(done_tx));

        self.send_submit(&task_id, task_type, data, params, opts)
            .await?;

        Ok(TaskHandle {
            task_id,
            rx: done_rx,
        })
    }

    /// Submit a task and invoke `callback` with its terminal outcome instead
    /// of returning a handle. Returns the task id.
    pub async fn submit_with_callback(
        &self,
        task_type: &str,
        data: Vec<u8>,
        params: BTreeMap<String, serde_json::Value>,
        opts: SubmitOptions,
        callback: impl FnOnce(TaskOutcome) + Send + 'static,
    ) -> Result<String> {
        let task_id = fresh_task_id();
        self.state
            .pending
            .lock()
            .unwrap()
            .insert(task_id.clone(), Waiter::Callback(Box::new(callback)));

        self.send_submit(&task_id, task_type, data, params, opts)
            .await?;
        Ok(task_id)
    }

    /// Decompose a compound task and submit every subtask as an ordinary
    /// task, returning handles in subtask order.
    ///
    /// The split happens client-side ([`HybridSplitter`] picks the strategy
    /// from the task's type); the coordinator only ever sees the subtasks.
    /// Note the subtask count may exceed `num_peers` for spatial splits,
    /// which tile the full resolution on a square grid.
    pub async fn submit_split(&self, task: &Task, num_peers: usize) -> Result<Vec<TaskHandle>> {
        let subtasks = HybridSplitter::new().split(task, num_peers);
        let mut handles = Vec::with_capacity(subtasks.len());
        for sub in subtasks {
            let Task {
                task_id,
                job_id,
                task_type,
                data,
                params,
                deadline_ms,
                priority,
                constraints,
                ..
            } = sub;

            let (done_tx, done_rx) = oneshot::channel();
            self.state
                .pending
                .lock()
                .unwrap()
                .insert(task_id.clone(), Waiter::Handle(done_tx));

            let opts = SubmitOptions {
                job_id: Some(job_id),
                priority,
                deadline_ms: Some(deadline_ms),
                constraints,
            };
            self.send_submit(&task_id, &task_type, data, params, opts)
                .await?;

            handles.push(TaskHandle {
                task_id,
                rx: done_rx,
            });
        }
        Ok(handles)
    }

    /// Submit a batch; handles come back in submission order.
    pub async fn submit_many(
        &self,
        specs: Vec<(String, Vec<u8>, BTreeMap<String, serde_json::Value>)>,
        opts: SubmitOptions,
    ) -> Result<Vec<TaskHandle>> {
        let mut handles = Vec::with_capacity(specs.len());
        for (task_type, data, params) in specs {
            handles.push(self.submit(&task_type, data, params, opts.clone()).await?);
        }
        Ok(handles)
    }

    /// Await a batch of handles; outcomes come back in handle order even
    /// though deliveries may arrive in any order.
    pub async fn gather(handles: Vec<TaskHandle>) -> Vec<Result<TaskOutcome>> {
        futures::future::join_all(handles.into_iter().map(|h| h.await_result())).await
    }

    /// Assemble collected outputs in the caller-supplied order.
    ///
    /// Returns the concatenated bytes of every successful result, plus the
    /// ids that were missing or failed (reported, not interleaved).
    pub fn assemble_stream(&self, order: &[String]) -> (Vec<u8>, Vec<String>) {
        let results = self.state.results.lock().unwrap();
        let mut stream = Vec::new();
        let mut missing = Vec::new();
        for task_id in order {
            match results.get(task_id) {
                Some(outcome) if outcome.success => stream.extend_from_slice(&outcome.result),
                _ => missing.push(task_id.clone()),
            }
        }
        (stream, missing)
    }

    /// Outcome of a task this client has already received, if any.
    pub fn result_of(&self, task_id: &str) -> Option<TaskOutcome> {
        self.state.results.lock().unwrap().get(task_id).cloned()
    }

    async fn send_submit(
        &self,
        task_id: &str,
        task_type: &str,
        data: Vec<u8>,
        params: BTreeMap<String, serde_json::Value>,
        opts: SubmitOptions,
    ) -> Result<()> {
        let submit = Message::TaskSubmit {
            task_id: task_id.to_string(),
            job_id: opts.job_id,
            task_type: task_type.to_string(),
            data,
            params,
            priority: opts.priority,
            deadline_ms: opts.deadline_ms,
            constraints: opts.constraints,
            requester_id: self.client_id.clone(),
        };
        info!("📤 Task submitted: {} ({})", task_type, task_id);
        self.tx
            .send(Envelope::new(submit))
            .await
            .map_err(|_| anyhow!(TaskErrorKind::TransportClosed))?;
        Ok(())
    }
}

fn handle_delivery(state: &SharedState, msg: Message) {
    match msg {
        Message::ResultDelivery {
            task_id,
            success,
            result,
            processing_time_ms,
            error,
            cached,
            cost_usd,
        } => {
            state.resolve(TaskOutcome {
                task_id,
                success,
                result,
                processing_time_ms,
                error,
                cached,
                cost_usd,
            });
        }
        Message::TaskTimeout { task_id, error } => {
            state.resolve(TaskOutcome {
                task_id,
                success: false,
                result: Vec::new(),
                processing_time_ms: 0.0,
                error: Some(error),
                cached: false,
                cost_usd: 0.0,
            });
        }
        other => debug!("Received: {}", other.type_name()),
    }
}

fn fresh_task_id() -> String {
    format!("task_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(task_id: &str, success: bool, payload: &[u8]) -> TaskOutcome {
        TaskOutcome {
            task_id: task_id.to_string(),
            success,
            result: payload.to_vec(),
            processing_time_ms: 1.0,
            error: None,
            cached: false,
            cost_usd: 0.0,
        }
    }

    #[test]
    fn resolve_feeds_handles_and_callbacks_once() {
        let state = SharedState {
            pending: Mutex::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
        };

        let (tx, mut rx) = oneshot::channel();
        state
            .pending
            .lock()
            .unwrap()
            .insert("t1".to_string(), Waiter::Handle(tx));

        state.resolve(outcome("t1", true, b"out"));
        assert_eq!(rx.try_recv().unwrap().result, b"out");

        // Second delivery for the same id has no waiter left.
        state.resolve(outcome("t1", true, b"again"));
        assert!(state.pending.lock().unwrap().is_empty());
    }

    #[test]
    fn error_kind_parses_wire_reasons() {
        let mut failed = outcome("t1", false, b"");
        failed.error = Some("peer_error: gpu fault".to_string());
        assert_eq!(failed.error_kind(), Some(TaskErrorKind::PeerError));

        failed.error = Some("timeout".to_string());
        assert_eq!(failed.error_kind(), Some(TaskErrorKind::Timeout));

        failed.error = Some("something else entirely".to_string());
        assert_eq!(failed.error_kind(), None);

        assert_eq!(outcome("t2", true, b"ok").error_kind(), None);
    }

    #[test]
    fn fail_all_pending_reports_transport_closed() {
        let state = SharedState {
            pending: Mutex::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
        };
        let (tx, mut rx) = oneshot::channel();
        state
            .pending
            .lock()
            .unwrap()
            .insert("t1".to_string(), Waiter::Handle(tx));

        state.fail_all_pending();
        let outcome = rx.try_recv().unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("transport_closed"));
    }

    #[test]
    fn stream_assembly_respects_caller_order_and_reports_missing() {
        let state = SharedState {
            pending: Mutex::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
        };
        // Results arrived out of order, one task failed, one never arrived.
        state.resolve(outcome("t2", true, b"BB"));
        state.resolve(outcome("t0", true, b"AA"));
        state.resolve(outcome("t1", false, b""));

        let client_state = Arc::new(state);
        let results = client_state.results.lock().unwrap();
        let mut stream = Vec::new();
        let mut missing = Vec::new();
        for id in ["t0", "t1", "t2", "t3"] {
            match results.get(id) {
                Some(o) if o.success => stream.extend_from_slice(&o.result),
                _ => missing.push(id.to_string()),
            }
        }
        assert_eq!(stream, b"AABB");
        assert_eq!(missing, vec!["t1".to_string(), "t3".to_string()]);
    }
}
