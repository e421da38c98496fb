//! # Peer Binary Entry Point
//!
//! Runs a P2C2R peer node: detects hardware capabilities, connects to the
//! coordinator and executes assigned tasks with the built-in executor table.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin peer -- --coord-addr 127.0.0.1:8765 --peer-id my_gpu_1 --gpu
//! ```

use clap::Parser;
use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;
use uuid::Uuid;

use p2c2r::peer::{capabilities, ExecutorRegistry, PeerNode};

/// Command-line arguments for the peer binary
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Coordinator address (host:port)
    #[arg(long, default_value = "127.0.0.1:8765")]
    coord_addr: String,

    /// Peer identifier; generated when omitted
    #[arg(long)]
    peer_id: Option<String>,

    /// Concurrent task slots to offer
    #[arg(long, default_value_t = 2)]
    max_in_flight: usize,

    /// Declare a GPU
    #[arg(long)]
    gpu: bool,

    /// GPU model name reported with the capabilities
    #[arg(long)]
    gpu_model: Option<String>,

    /// Link latency to the coordinator reported in heartbeats (ms)
    #[arg(long, default_value_t = 10.0)]
    latency_ms: f64,
}

/// Initialize logging with timestamp, level, and message formatting.
fn init_logger() {
    Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] [{}] {}",
                chrono::Local::now().format("%H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();

    let args = Args::parse();
    let peer_id = args
        .peer_id
        .unwrap_or_else(|| format!("peer_{}", &Uuid::new_v4().simple().to_string()[..8]));

    let caps = capabilities::detect(args.gpu, args.gpu_model);
    log::info!(
        "🖥️  {} capabilities: {} cores, {:.1} GB RAM, gpu: {}",
        peer_id,
        caps.cpu_cores,
        caps.ram_gb,
        caps.gpu
    );

    let peer = PeerNode::new(
        peer_id,
        args.coord_addr,
        caps,
        ExecutorRegistry::builtin(),
        args.max_in_flight,
        args.latency_ms,
    );

    tokio::select! {
        _ = peer.run() => Ok(()),
        _ = tokio::signal::ctrl_c() => {
            log::info!("👋 Peer node shutting down...");
            Ok(())
        }
    }
}
