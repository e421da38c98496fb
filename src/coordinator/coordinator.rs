//! # Coordinator - Network Layer
//!
//! Owns the TCP listener and every connected peer/renter session, routing
//! frames to the [`Scheduler`]. All coordination state (peer registry, task
//! table, cache, history) hangs off the scheduler; this layer is connection
//! plumbing:
//!
//! ## Connection handling
//! Each accepted connection is served by its own task. The first message
//! decides the role: `peer_register` or `gamer_register`; anything else drops
//! the connection. Every connection gets a dedicated writer task fed through
//! a channel, which serializes outbound frames (one in flight per
//! connection).
//!
//! ## Background tasks
//! - **Heartbeat monitor**: sweeps for peers whose last heartbeat is older
//!   than `peer_timeout_s`, unregistering them and reclaiming their tasks.
//! - **Cache sweeper**: drops expired result-cache entries, and expired
//!   storage rows once an hour.
//! - **Stats loop**: periodic operational summary.
//!
//! Like the scheduler, the coordinator is a cheap-to-clone handle over shared
//! state; each connection task and background loop owns a clone.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::common::connection::{Connection, ConnectionReader};
use crate::common::messages::{now_ts, Capabilities, Envelope, Message};
use crate::coordinator::cache::ResultCache;
use crate::coordinator::config::CoordinatorConfig;
use crate::coordinator::registry::PeerRegistry;
use crate::coordinator::scheduler::{RenterDirectory, Scheduler};
use crate::coordinator::storage::Storage;
use crate::coordinator::tasks::TaskTable;

/// Seconds between stats log lines.
const STATS_INTERVAL: Duration = Duration::from_secs(30);
/// Seconds between storage expiry sweeps.
const STORAGE_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// The coordinator process: listener plus shared scheduling state.
#[derive(Clone)]
pub struct Coordinator {
    config: CoordinatorConfig,
    scheduler: Scheduler,
    started_at: f64,
}

impl Coordinator {
    /// Build a coordinator from configuration, opening storage when a
    /// database path is configured.
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        let storage = match &config.db_path {
            Some(path) => Some(Arc::new(Storage::open(path, config.result_cache_ttl_s)?)),
            None => None,
        };

        let registry = Arc::new(PeerRegistry::new(
            config.max_in_flight_per_peer,
            config.initial_reputation,
        ));
        let tasks = Arc::new(TaskTable::new(config.submit_queue_capacity));
        let cache = Arc::new(ResultCache::new(
            config.cache_capacity,
            config.result_cache_ttl_s,
        ));
        let renters = Arc::new(RenterDirectory::new());
        let scheduler = Scheduler::new(
            config.clone(),
            registry,
            tasks,
            cache,
            storage,
            renters,
        );

        Ok(Self {
            config,
            scheduler,
            started_at: now_ts(),
        })
    }

    /// The shared scheduling engine (also the introspection surface).
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<()> {
        let addr = format!("{}:{}", self.config.listen_host, self.config.listen_port);
        let listener = TcpListener::bind(&addr).await?;
        info!("🌩️  Coordinator listening on {}", addr);
        self.serve(listener).await
    }

    /// Serve on an already bound listener (lets tests bind port 0).
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let monitor = self.clone();
        tokio::spawn(async move { monitor.monitor_peers().await });

        let sweeper = self.clone();
        tokio::spawn(async move { sweeper.sweep_cache().await });

        let stats = self.clone();
        tokio::spawn(async move { stats.stats_loop().await });

        loop {
            match listener.accept().await {
                Ok((socket, addr)) => {
                    debug!("🔗 Accepted connection from {}", addr);
                    let coordinator = self.clone();
                    tokio::spawn(async move {
                        coordinator
                            .handle_connection(socket, addr.ip().to_string())
                            .await;
                    });
                }
                Err(e) => error!("❌ Accept error: {}", e),
            }
        }
    }

    /// Serve one connection: the first frame decides whether this is a peer
    /// or a renter session.
    async fn handle_connection(&self, socket: TcpStream, remote_ip: String) {
        let (mut reader, mut writer) = Connection::new(socket).into_split();

        let first = match reader.read_message().await {
            Ok(Some(envelope)) => envelope,
            _ => return,
        };

        // Dedicated writer task: one frame in flight per connection.
        let (tx, mut rx) = mpsc::channel::<Envelope>(64);
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if writer.write_message(&envelope).await.is_err() {
                    break;
                }
            }
        });

        match first.msg {
            Message::PeerRegister {
                peer_id,
                capabilities,
            } => {
                self.serve_peer(reader, tx, peer_id, capabilities, remote_ip)
                    .await;
            }
            Message::GamerRegister { client_id } => {
                self.serve_renter(reader, tx, client_id, remote_ip).await;
            }
            other => {
                warn!(
                    "❌ Connection opened with {} instead of a registration, dropping",
                    other.type_name()
                );
            }
        }
    }

    async fn serve_peer(
        &self,
        mut reader: ConnectionReader,
        tx: mpsc::Sender<Envelope>,
        peer_id: String,
        capabilities: Capabilities,
        remote_ip: String,
    ) {
        let scheduler = &self.scheduler;

        // A peer_id arriving on a new connection replaces any prior session:
        // the old session's tasks are reclaimed before this one is accepted.
        if scheduler.registry().session_of(&peer_id).await.is_some() {
            warn!("♻️  Peer {} re-registered from a new session", peer_id);
            scheduler.handle_peer_down(&peer_id, "replaced").await;
        }

        let session = scheduler
            .registry()
            .register(&peer_id, capabilities, tx.clone())
            .await;
        if let Some(storage) = scheduler.storage() {
            let _ = storage.register_peer(&peer_id, &remote_ip);
        }

        tx.send(Envelope::new(Message::PeerRegisterResponse {
            success: true,
            peer_id: peer_id.clone(),
            error: None,
        }))
        .await
        .ok();

        // Fresh capacity: anything waiting in the queue gets another shot.
        scheduler.dispatch_queued().await;

        loop {
            match reader.read_message().await {
                Ok(Some(envelope)) => match envelope.msg {
                    Message::Heartbeat {
                        peer_id: from,
                        load,
                        telemetry,
                        ..
                    } => {
                        scheduler.handle_heartbeat(&from, load, telemetry).await;
                    }
                    Message::TaskResult {
                        task_id,
                        peer_id: from,
                        success,
                        result,
                        processing_time_ms,
                        error,
                    } => {
                        scheduler
                            .handle_task_result(
                                &task_id,
                                &from,
                                success,
                                result,
                                processing_time_ms,
                                error,
                            )
                            .await;
                    }
                    // Re-registration on the same session is a no-op.
                    Message::PeerRegister { peer_id: from, .. } if from == peer_id => {
                        tx.send(Envelope::new(Message::PeerRegisterResponse {
                            success: true,
                            peer_id: peer_id.clone(),
                            error: None,
                        }))
                        .await
                        .ok();
                    }
                    other => debug!("Peer {} sent {}", peer_id, other.type_name()),
                },
                Ok(None) => break,
                Err(e) => {
                    error!("❌ Error reading from peer {}: {}", peer_id, e);
                    break;
                }
            }
        }

        debug!("🔌 Peer connection closed: {}", peer_id);
        self.scheduler
            .handle_peer_disconnect(&peer_id, session, "connection_lost")
            .await;
    }

    async fn serve_renter(
        &self,
        mut reader: ConnectionReader,
        tx: mpsc::Sender<Envelope>,
        client_id: String,
        remote_ip: String,
    ) {
        let scheduler = &self.scheduler;

        scheduler.renters().register(&client_id, tx.clone()).await;
        if let Some(storage) = scheduler.storage() {
            let _ = storage.register_gamer(&client_id, &remote_ip);
        }
        info!("🎮 Gamer connected: {} ({})", client_id, remote_ip);

        tx.send(Envelope::new(Message::GamerRegisterResponse {
            success: true,
            client_id: client_id.clone(),
            available_peers: scheduler.registry().available_count().await,
        }))
        .await
        .ok();

        loop {
            match reader.read_message().await {
                Ok(Some(envelope)) => match envelope.msg {
                    Message::TaskSubmit {
                        task_id,
                        job_id,
                        task_type,
                        data,
                        params,
                        priority,
                        deadline_ms,
                        constraints,
                        requester_id,
                    } => {
                        // Submissions are attributed to the registered
                        // session, not whatever id the frame claims.
                        let _ = requester_id;
                        scheduler
                            .submit(
                                task_id,
                                job_id,
                                task_type,
                                data,
                                params,
                                priority,
                                deadline_ms,
                                constraints,
                                client_id.clone(),
                            )
                            .await;
                    }
                    other => debug!("Gamer {} sent {}", client_id, other.type_name()),
                },
                Ok(None) => break,
                Err(e) => {
                    error!("❌ Error reading from gamer {}: {}", client_id, e);
                    break;
                }
            }
        }

        info!("🎮 Gamer disconnected: {}", client_id);
        scheduler.renters().unregister(&client_id).await;
    }

    // ========================================================================
    // BACKGROUND LOOPS
    // ========================================================================

    /// Declare peers dead after `peer_timeout_s` without a heartbeat.
    async fn monitor_peers(&self) {
        let interval = Duration::from_secs(self.config.monitor_interval_s);
        let timeout = Duration::from_secs(self.config.peer_timeout_s);
        loop {
            tokio::time::sleep(interval).await;
            for peer_id in self.scheduler.registry().stale_peers(timeout).await {
                warn!(
                    "⚠️  Peer timeout: {} (no heartbeat for {}s)",
                    peer_id, self.config.peer_timeout_s
                );
                self.scheduler
                    .handle_peer_down(&peer_id, "heartbeat_timeout")
                    .await;
            }
        }
    }

    /// Expire cache entries, and storage rows once an hour.
    async fn sweep_cache(&self) {
        let interval = Duration::from_secs(self.config.cache_sweep_interval_s.max(1));
        let sweeps_per_storage_pass =
            (STORAGE_SWEEP_INTERVAL.as_secs() / interval.as_secs()).max(1);
        let mut sweeps = 0u64;
        loop {
            tokio::time::sleep(interval).await;
            let dropped = self.scheduler.cache().sweep_expired();
            if dropped > 0 {
                debug!("🧹 Dropped {} expired cache entries", dropped);
            }
            sweeps += 1;
            if sweeps % sweeps_per_storage_pass == 0 {
                if let Some(storage) = self.scheduler.storage() {
                    let _ = storage.cleanup_expired();
                }
            }
        }
    }

    /// Periodic operational summary.
    async fn stats_loop(&self) {
        loop {
            tokio::time::sleep(STATS_INTERVAL).await;
            let uptime_mins = (now_ts() - self.started_at) / 60.0;
            let peers = self.scheduler.registry().len().await;
            let renters = self.scheduler.renters().len().await;
            let (completed, failed) = self.scheduler.tasks().terminal_counts().await;

            info!("📊 Network stats:");
            info!("   Uptime: {:.1} minutes", uptime_mins);
            info!("   Active peers: {} | Active gamers: {}", peers, renters);
            info!(
                "   Tasks routed: {} (completed: {}, failed: {})",
                self.scheduler.tasks_routed(),
                completed,
                failed
            );
            info!(
                "   Revenue: ${:.6} (coordinator fee)",
                self.scheduler.revenue_usd()
            );
            if let Some(storage) = self.scheduler.storage() {
                let stats = storage.statistics();
                info!(
                    "   Database: {} tasks stored, ${:.6} total",
                    stats.total_tasks_completed, stats.total_revenue_usd
                );
            }
        }
    }
}
