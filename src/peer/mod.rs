//! # Peer Components
//!
//! A peer is a worker process contributing compute to the network:
//!
//! ## Peer Node ([`peer`])
//! The connection loop: register with the coordinator, receive task
//! assignments, execute them concurrently and return results, emitting
//! heartbeats throughout.
//!
//! ## Executors ([`executors`])
//! The pluggable `task_type → executor` table, preloaded with simulated
//! implementations for every documented task type.
//!
//! ## Capabilities ([`capabilities`])
//! Hardware detection at startup and load telemetry sampling for heartbeats.

pub mod capabilities;
pub mod executors;
pub mod peer;

// Re-export for convenience
pub use executors::{ExecutorRegistry, TaskExecutor};
pub use peer::PeerNode;
