//! # Peer Node
//!
//! A worker that contributes compute to the network. The loop contract:
//! connect to the coordinator, register capabilities, then concurrently
//! - receive `task_assign` messages and execute them through the installed
//!   executor table (bounded by `max_in_flight`, never blocking the receive
//!   loop),
//! - return `task_result` messages with measured processing time,
//! - emit `heartbeat` messages at a fixed interval.
//!
//! Executor errors are captured into failed results; they never unwind the
//! receive loop. On disconnect the peer retries the coordinator every few
//! seconds, re-registering under the same `peer_id` (the coordinator reclaims
//! anything the previous session left assigned).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{debug, error, info, warn};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::common::connection::Connection;
use crate::common::messages::{Capabilities, Envelope, Message};
use crate::peer::capabilities::TelemetrySampler;
use crate::peer::executors::ExecutorRegistry;

/// Seconds between heartbeats.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// Base delay before reconnecting after a lost session.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// One peer worker process.
pub struct PeerNode {
    peer_id: String,
    coord_addr: String,
    capabilities: Capabilities,
    executors: Arc<ExecutorRegistry>,
    max_in_flight: usize,
    sampler: TelemetrySampler,
    in_flight: Arc<AtomicU64>,
    tasks_completed: Arc<AtomicU64>,
    tasks_failed: Arc<AtomicU64>,
}

impl PeerNode {
    pub fn new(
        peer_id: impl Into<String>,
        coord_addr: impl Into<String>,
        capabilities: Capabilities,
        executors: ExecutorRegistry,
        max_in_flight: usize,
        latency_ms: f64,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            coord_addr: coord_addr.into(),
            capabilities,
            executors: Arc::new(executors),
            max_in_flight: max_in_flight.max(1),
            sampler: TelemetrySampler::new(latency_ms),
            in_flight: Arc::new(AtomicU64::new(0)),
            tasks_completed: Arc::new(AtomicU64::new(0)),
            tasks_failed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Connect and work until the process is stopped. Lost connections are
    /// retried indefinitely with a small random jitter so a fleet of peers
    /// does not reconnect in lockstep.
    pub async fn run(&self) {
        info!("🚀 Starting peer node: {}", self.peer_id);
        info!("   Connecting to: {}", self.coord_addr);

        loop {
            match self.run_session().await {
                Ok(()) => warn!("Connection closed by coordinator"),
                Err(e) => error!("Connection error: {}", e),
            }
            let jitter = rand::thread_rng().gen_range(0..500);
            tokio::time::sleep(RECONNECT_DELAY + Duration::from_millis(jitter)).await;
            info!("Retrying coordinator at {}...", self.coord_addr);
        }
    }

    /// One connected session: register, then serve assignments until the
    /// connection drops.
    pub async fn run_session(&self) -> Result<()> {
        let stream = TcpStream::connect(&self.coord_addr).await?;
        let (mut reader, mut writer) = Connection::new(stream).into_split();

        // All frames leave through one channel, one at a time.
        let (tx, mut rx) = mpsc::channel::<Envelope>(64);

        tx.send(Envelope::new(Message::PeerRegister {
            peer_id: self.peer_id.clone(),
            capabilities: self.capabilities.clone(),
        }))
        .await
        .ok();

        let writer_loop = async move {
            while let Some(envelope) = rx.recv().await {
                if writer.write_message(&envelope).await.is_err() {
                    break;
                }
            }
        };

        let heartbeat_tx = tx.clone();
        let heartbeat_loop = async {
            // First heartbeat goes out immediately so the coordinator has
            // telemetry (notably the reported latency) before the first
            // scheduling decision.
            loop {
                let in_flight = self.in_flight.load(Ordering::Relaxed);
                let heartbeat = Message::Heartbeat {
                    peer_id: self.peer_id.clone(),
                    load: in_flight as f64 / self.max_in_flight as f64,
                    tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
                    tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
                    telemetry: self.sampler.sample(),
                };
                debug!("💓 {} heartbeat (in_flight: {})", self.peer_id, in_flight);
                if heartbeat_tx.send(Envelope::new(heartbeat)).await.is_err() {
                    break;
                }
                tokio::time::sleep(HEARTBEAT_INTERVAL).await;
            }
        };

        let read_loop = async {
            loop {
                match reader.read_message().await? {
                    Some(envelope) => self.handle_message(envelope.msg, &tx).await,
                    None => return Ok::<(), anyhow::Error>(()),
                }
            }
        };

        tokio::select! {
            _ = writer_loop => Ok(()),
            _ = heartbeat_loop => Ok(()),
            res = read_loop => res,
        }
    }

    async fn handle_message(&self, msg: Message, tx: &mpsc::Sender<Envelope>) {
        match msg {
            Message::PeerRegisterResponse { success, error, .. } => {
                if success {
                    info!("✓ Registration confirmed by coordinator");
                } else {
                    error!(
                        "✗ Registration rejected: {}",
                        error.unwrap_or_else(|| "unspecified".to_string())
                    );
                }
            }

            Message::TaskAssign {
                task_id,
                task_type,
                data,
                params,
            } => {
                info!("📋 Task assigned: {} ({})", task_id, task_type);
                // Execution runs concurrently so the receive loop stays
                // responsive; the coordinator bounds concurrency by not
                // assigning past max_in_flight.
                let executors = Arc::clone(&self.executors);
                let in_flight = Arc::clone(&self.in_flight);
                let completed = Arc::clone(&self.tasks_completed);
                let failed = Arc::clone(&self.tasks_failed);
                let peer_id = self.peer_id.clone();
                let tx = tx.clone();

                tokio::spawn(async move {
                    in_flight.fetch_add(1, Ordering::Relaxed);
                    let start = Instant::now();
                    let outcome = executors.execute(&task_type, &data, &params).await;
                    let processing_time_ms = start.elapsed().as_secs_f64() * 1000.0;
                    in_flight.fetch_sub(1, Ordering::Relaxed);

                    let result_msg = match outcome {
                        Ok(output) => {
                            completed.fetch_add(1, Ordering::Relaxed);
                            info!(
                                "✓ Task {} completed in {:.1}ms",
                                task_id, processing_time_ms
                            );
                            Message::TaskResult {
                                task_id,
                                peer_id,
                                success: true,
                                result: output,
                                processing_time_ms,
                                error: None,
                            }
                        }
                        Err(e) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                            error!("✗ Task {} failed: {}", task_id, e);
                            Message::TaskResult {
                                task_id,
                                peer_id,
                                success: false,
                                result: Vec::new(),
                                processing_time_ms,
                                error: Some(e.to_string()),
                            }
                        }
                    };

                    // Send failure just means the session ended mid-task.
                    let _ = tx.send(Envelope::new(result_msg)).await;
                });
            }

            other => debug!("Received: {}", other.type_name()),
        }
    }
}
