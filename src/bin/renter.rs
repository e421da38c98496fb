//! # Renter Binary Entry Point
//!
//! Runs a P2C2R renter client that submits a demo workload and prints the
//! results: a few single tasks, then a ray-tracing frame decomposed into
//! tiles by the spatial splitter, submitted as ordinary tasks, gathered and
//! reassembled in tile order.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin renter -- --coord-addr 127.0.0.1:8765 --client-id gamer_1
//! ```

use std::collections::BTreeMap;

use clap::Parser;
use env_logger::Builder;
use log::LevelFilter;
use serde_json::json;
use std::io::Write;
use uuid::Uuid;

use p2c2r::common::messages::now_ts;
use p2c2r::coordinator::tasks::Task;
use p2c2r::renter::{RenterClient, SubmitOptions};
use p2c2r::Constraints;

/// Command-line arguments for the renter binary
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Coordinator address (host:port)
    #[arg(long, default_value = "127.0.0.1:8765")]
    coord_addr: String,

    /// Client identifier; generated when omitted
    #[arg(long)]
    client_id: Option<String>,

    /// Number of peers to split the ray-tracing frame across
    #[arg(long, default_value_t = 4)]
    split: usize,

    /// Per-task deadline in milliseconds
    #[arg(long, default_value_t = 5000)]
    deadline_ms: u64,
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

fn params(pairs: &[(&str, serde_json::Value)]) -> BTreeMap<String, serde_json::Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();

    let args = Args::parse();
    let client_id = args
        .client_id
        .unwrap_or_else(|| format!("gamer_{}", &Uuid::new_v4().simple().to_string()[..8]));

    let client = RenterClient::connect(&args.coord_addr, &client_id).await?;
    let opts = SubmitOptions {
        deadline_ms: Some(args.deadline_ms),
        ..Default::default()
    };

    // A few single tasks of different types.
    log::info!("1️⃣  Submitting pathfinding task...");
    let path = client
        .submit(
            "ai_pathfinding",
            Vec::new(),
            params(&[("start", json!([0, 0])), ("goal", json!([12, 7]))]),
            opts.clone(),
        )
        .await?;

    log::info!("2️⃣  Submitting physics task...");
    let physics = client
        .submit(
            "physics",
            Vec::new(),
            params(&[("num_objects", json!(50))]),
            opts.clone(),
        )
        .await?;

    for handle in [path, physics] {
        let outcome = handle.await_result().await?;
        log::info!(
            "✓ {} -> success: {} ({:.1}ms, cached: {})",
            outcome.task_id,
            outcome.success,
            outcome.processing_time_ms,
            outcome.cached
        );
    }

    // One compound ray-tracing frame, decomposed into tiles client-side and
    // submitted as ordinary tasks.
    log::info!(
        "3️⃣  Splitting a 640x360 ray-tracing frame across {} peers...",
        args.split
    );
    let frame = Task {
        task_id: format!("frame_{}", &Uuid::new_v4().simple().to_string()[..8]),
        job_id: "demo_frame".to_string(),
        task_type: "raytracing".to_string(),
        data: Vec::new(),
        params: params(&[("complexity", json!(150)), ("resolution", json!([640, 360]))]),
        deadline_ms: args.deadline_ms,
        priority: 0,
        constraints: Constraints::default(),
        submitted_at: now_ts(),
        attempts: 0,
    };
    let handles = client.submit_split(&frame, args.split).await?;
    let tile_count = handles.len();
    log::info!("   {} tiles submitted", tile_count);
    let order: Vec<String> = handles.iter().map(|h| h.task_id().to_string()).collect();

    let outcomes = RenterClient::gather(handles).await;
    let succeeded = outcomes
        .iter()
        .filter(|o| o.as_ref().map(|o| o.success).unwrap_or(false))
        .count();
    log::info!("✓ Frame done: {}/{} tiles succeeded", succeeded, tile_count);
    for outcome in outcomes.iter().flatten() {
        if let Some(kind) = outcome.error_kind() {
            log::warn!("✗ Tile {} failed: {}", outcome.task_id, kind);
        }
    }

    let (stream, missing) = client.assemble_stream(&order);
    log::info!(
        "🎞️  Assembled stream: {} bytes ({} missing)",
        stream.len(),
        missing.len()
    );

    Ok(())
}
