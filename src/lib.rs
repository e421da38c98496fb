//! # P2C2R - Peer-to-Cloud-to-Renter Compute Fabric
//!
//! A distributed compute-offload network with three roles:
//!
//! 1. **Coordinator**: the central server holding all authoritative state -
//!    peer registry, task table, result cache, reputation and performance
//!    history. Routes every task from submission to terminal delivery.
//! 2. **Peer**: a worker that registers its capabilities, executes assigned
//!    tasks through a pluggable executor table and reports heartbeats.
//! 3. **Renter** (gamer): a client that submits tasks and awaits results.
//!
//! The scheduler is the core: it selects peers using learned performance
//! data, enforces per-task deadlines, retries failures on alternate peers,
//! maintains reputation and deduplicates identical in-flight work.
//!
//! ## Modules
//!
//! - [`common`]: wire protocol, framed TCP connection, config loading
//! - [`coordinator`]: registry, task lifecycle, selection policy, failover,
//!   cache and persistence
//! - [`peer`]: executor registry and the peer task loop
//! - [`renter`]: submit/await client with ordered stream assembly
//! - [`splitter`]: spatial/functional/pipeline task decomposition
//! - [`error`]: boundary error kinds

pub mod common;
pub mod coordinator;
pub mod error;
pub mod peer;
pub mod renter;
pub mod splitter;

// Re-export commonly used types for convenience
pub use common::messages::{Capabilities, Constraints, Envelope, Message, Telemetry};
pub use coordinator::{Coordinator, CoordinatorConfig};
pub use peer::{ExecutorRegistry, PeerNode, TaskExecutor};
pub use renter::{RenterClient, SubmitOptions, TaskOutcome};
