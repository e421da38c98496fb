//! # Coordinator Binary Entry Point
//!
//! Runs the P2C2R coordinator: the central server that peers and renters
//! connect to.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin coordinator -- --host 0.0.0.0 --port 8765
//! cargo run --bin coordinator -- --config config/coordinator.toml --db p2c2r.db
//! ```
//!
//! Command-line flags override values from the optional TOML config file.
//! Exits 0 on a clean shutdown signal, nonzero on startup failure.

use clap::Parser;
use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;

use p2c2r::coordinator::{Coordinator, CoordinatorConfig};

/// Command-line arguments for the coordinator binary
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Interface to bind (overrides config file)
    #[arg(long)]
    host: Option<String>,

    /// TCP port to listen on (overrides config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// SQLite database path; enables result persistence
    #[arg(long)]
    db: Option<String>,
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

    let mut config = match &args.config {
        Some(path) => CoordinatorConfig::from_file(path)?,
        None => CoordinatorConfig::default(),
    };
    if let Some(host) = args.host {
        config.listen_host = host;
    }
    if let Some(port) = args.port {
        config.listen_port = port;
    }
    if let Some(db) = args.db {
        config.db_path = Some(db);
    }

    let coordinator = Coordinator::new(config)?;

    tokio::select! {
        res = coordinator.run() => res,
        _ = tokio::signal::ctrl_c() => {
            log::info!("👋 Coordinator shutting down...");
            Ok(())
        }
    }
}
