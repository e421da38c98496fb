//! # Task Splitting Strategies
//!
//! Decomposes compound tasks into subtasks before submission. The scheduler
//! never sees compound types; it treats every subtask as an ordinary task.
//!
//! Three strategies compose through [`HybridSplitter`], dispatched on the
//! task's type:
//! - **Spatial** (`raytracing`): partition the output resolution into a
//!   √N × √N tile grid, weighting each tile's estimated complexity so peers
//!   get comparable computational cost rather than equal area.
//! - **Functional** (`game_frame`): partition a compound frame into named
//!   subsystems, each with its own deadline factor and capability needs.
//! - **Pipeline** (`rendering`): partition into ordered stages, each stage
//!   depending on its predecessor by task id.
//!
//! All splitters are pure: same task in, same subtasks out.

use serde_json::{json, Value};

use crate::common::messages::Constraints;
use crate::coordinator::tasks::Task;

/// A rectangular region of the output image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileBounds {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl TileBounds {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Split rendering work spatially into tiles of comparable estimated cost.
pub struct SpatialSplitter;

impl SpatialSplitter {
    /// Partition the task's `resolution` into a √N × √N grid; the last row
    /// and column absorb any remainder so the tiles always cover the full
    /// image.
    pub fn split(&self, task: &Task, num_peers: usize) -> Vec<Task> {
        let (width, height) = resolution_of(task);
        let tiles = make_tiles(width, height, num_peers);

        tiles
            .iter()
            .enumerate()
            .map(|(i, tile)| {
                let mut sub = task.clone();
                sub.task_id = format!("{}_tile_{}", task.task_id, i);
                sub.params.insert(
                    "tile_bounds".to_string(),
                    json!({
                        "x": tile.x,
                        "y": tile.y,
                        "width": tile.width,
                        "height": tile.height,
                    }),
                );
                sub.params.insert("tile_index".to_string(), json!(i));
                sub.params
                    .insert("total_tiles".to_string(), json!(tiles.len()));
                sub.params.insert(
                    "estimated_complexity".to_string(),
                    json!(tile_complexity(&task.task_type, tile, width, height)),
                );
                sub
            })
            .collect()
    }
}

fn resolution_of(task: &Task) -> (u32, u32) {
    task.params
        .get("resolution")
        .and_then(Value::as_array)
        .filter(|pair| pair.len() == 2)
        .map(|pair| {
            (
                pair[0].as_u64().unwrap_or(1920) as u32,
                pair[1].as_u64().unwrap_or(1080) as u32,
            )
        })
        .unwrap_or((1920, 1080))
}

fn make_tiles(width: u32, height: u32, num_peers: usize) -> Vec<TileBounds> {
    let grid = (num_peers.max(1) as f64).sqrt().ceil() as u32;
    let tile_width = width / grid;
    let tile_height = height / grid;

    let mut tiles = Vec::with_capacity((grid * grid) as usize);
    for row in 0..grid {
        for col in 0..grid {
            let x = col * tile_width;
            let y = row * tile_height;
            // Last column/row absorbs the division remainder.
            let w = if col == grid - 1 { width - x } else { tile_width };
            let h = if row == grid - 1 { height - y } else { tile_height };
            tiles.push(TileBounds {
                x,
                y,
                width: w,
                height: h,
            });
        }
    }
    tiles
}

/// Estimated computational cost of one tile.
///
/// Ray tracing uses a distance-from-center density model (scene geometry
/// clusters near the center); everything else is uniform per pixel.
fn tile_complexity(task_type: &str, tile: &TileBounds, width: u32, height: u32) -> f64 {
    if task_type != "raytracing" {
        return tile.area() as f64;
    }

    let center_x = width as f64 / 2.0;
    let center_y = height as f64 / 2.0;
    let max_dist = (center_x * center_x + center_y * center_y).sqrt();

    let tile_cx = tile.x as f64 + tile.width as f64 / 2.0;
    let tile_cy = tile.y as f64 + tile.height as f64 / 2.0;
    let dx = tile_cx - center_x;
    let dy = tile_cy - center_y;
    let dist = (dx * dx + dy * dy).sqrt();

    let weight = 1.0 + (1.0 - dist / max_dist) * 2.0;
    tile.area() as f64 * weight
}

/// Split a compound game frame into subsystem tasks.
pub struct FunctionalSplitter;

struct Subsystem {
    task_type: &'static str,
    /// Scales the base deadline; some subsystems tolerate more slack
    deadline_factor: f64,
    requires: Constraints,
}

impl FunctionalSplitter {
    fn subsystems() -> Vec<Subsystem> {
        vec![
            Subsystem {
                task_type: "physics",
                deadline_factor: 1.0,
                requires: Constraints {
                    min_cpu_cores: 4,
                    ..Default::default()
                },
            },
            Subsystem {
                task_type: "ai_dialogue",
                deadline_factor: 2.0,
                requires: Constraints {
                    min_cpu_cores: 2,
                    ..Default::default()
                },
            },
            Subsystem {
                task_type: "rendering",
                deadline_factor: 1.0,
                requires: Constraints {
                    requires_gpu: true,
                    ..Default::default()
                },
            },
            Subsystem {
                task_type: "raytracing",
                deadline_factor: 6.0,
                requires: Constraints {
                    requires_gpu: true,
                    ..Default::default()
                },
            },
            Subsystem {
                task_type: "audio",
                deadline_factor: 1.5,
                requires: Constraints {
                    min_cpu_cores: 1,
                    ..Default::default()
                },
            },
        ]
    }

    /// One subtask per subsystem, limited to the number of available peers.
    pub fn split(&self, task: &Task, num_peers: usize) -> Vec<Task> {
        Self::subsystems()
            .into_iter()
            .take(num_peers.max(1))
            .map(|subsystem| {
                let mut sub = task.clone();
                sub.task_id = format!("{}_{}", task.task_id, subsystem.task_type);
                sub.task_type = subsystem.task_type.to_string();
                sub.deadline_ms =
                    (task.deadline_ms as f64 * subsystem.deadline_factor) as u64;
                sub.constraints = subsystem.requires;
                sub.params
                    .insert("subsystem".to_string(), json!(subsystem.task_type));
                sub
            })
            .collect()
    }
}

/// Split rendering into sequential pipeline stages.
pub struct PipelineSplitter;

const PIPELINE_STAGES: &[&str] = &["geometry", "lighting", "post_processing"];

impl PipelineSplitter {
    /// Ordered stages, each carrying a `depends_on` reference to its
    /// predecessor's task id.
    pub fn split(&self, task: &Task, num_peers: usize) -> Vec<Task> {
        PIPELINE_STAGES
            .iter()
            .take(num_peers.max(1))
            .enumerate()
            .map(|(i, stage)| {
                let mut sub = task.clone();
                sub.task_id = format!("{}_stage_{}", task.task_id, i);
                sub.constraints = Constraints {
                    requires_gpu: true,
                    ..Default::default()
                };
                sub.params.insert("stage".to_string(), json!(stage));
                sub.params.insert("stage_index".to_string(), json!(i));
                sub.params.insert(
                    "depends_on".to_string(),
                    if i > 0 {
                        json!(format!("{}_stage_{}", task.task_id, i - 1))
                    } else {
                        Value::Null
                    },
                );
                sub
            })
            .collect()
    }
}

/// Dispatch the right strategy on the task's type.
pub struct HybridSplitter {
    spatial: SpatialSplitter,
    functional: FunctionalSplitter,
    pipeline: PipelineSplitter,
}

impl HybridSplitter {
    pub fn new() -> Self {
        Self {
            spatial: SpatialSplitter,
            functional: FunctionalSplitter,
            pipeline: PipelineSplitter,
        }
    }

    /// Split a task for distribution over `num_peers` workers. Unsplittable
    /// types come back as a single task, unchanged.
    pub fn split(&self, task: &Task, num_peers: usize) -> Vec<Task> {
        match task.task_type.as_str() {
            "raytracing" => self.spatial.split(task, num_peers),
            "game_frame" => self.functional.split(task, num_peers),
            "rendering" => self.pipeline.split(task, num_peers),
            _ => vec![task.clone()],
        }
    }
}

impl Default for HybridSplitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::messages::now_ts;
    use std::collections::BTreeMap;

    fn task(task_type: &str, params: &[(&str, Value)]) -> Task {
        Task {
            task_id: "t1".to_string(),
            job_id: "job_1".to_string(),
            task_type: task_type.to_string(),
            data: vec![0u8; 16],
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
            deadline_ms: 1_000,
            priority: 0,
            constraints: Constraints::default(),
            submitted_at: now_ts(),
            attempts: 0,
        }
    }

    #[test]
    fn spatial_tiles_cover_the_full_resolution() {
        let t = task("raytracing", &[("resolution", json!([1920, 1080]))]);
        let subs = SpatialSplitter.split(&t, 4);
        assert_eq!(subs.len(), 4);

        let covered: u64 = subs
            .iter()
            .map(|s| {
                let b = &s.params["tile_bounds"];
                b["width"].as_u64().unwrap() * b["height"].as_u64().unwrap()
            })
            .sum();
        assert_eq!(covered, 1920 * 1080);
    }

    #[test]
    fn spatial_remainder_lands_in_last_row_and_column() {
        // 5 peers → 3x3 grid over 100x70: 33px columns and 23px rows, with
        // the last ones absorbing the remainder.
        let t = task("raytracing", &[("resolution", json!([100, 70]))]);
        let subs = SpatialSplitter.split(&t, 5);
        assert_eq!(subs.len(), 9);

        let last = &subs.last().unwrap().params["tile_bounds"];
        assert_eq!(last["x"].as_u64().unwrap(), 66);
        assert_eq!(last["width"].as_u64().unwrap(), 34);
        assert_eq!(last["y"].as_u64().unwrap(), 46);
        assert_eq!(last["height"].as_u64().unwrap(), 24);
    }

    #[test]
    fn spatial_center_tiles_cost_more_for_raytracing() {
        let t = task("raytracing", &[("resolution", json!([900, 900]))]);
        let subs = SpatialSplitter.split(&t, 9);

        let complexity = |idx: usize| {
            subs[idx].params["estimated_complexity"]
                .as_f64()
                .unwrap()
        };
        // 3x3 grid: index 4 is the center tile, index 0 a corner.
        assert!(complexity(4) > complexity(0));
    }

    #[test]
    fn functional_split_scales_deadlines_and_constraints() {
        let t = task("game_frame", &[]);
        let subs = FunctionalSplitter.split(&t, 5);
        assert_eq!(subs.len(), 5);

        let physics = subs.iter().find(|s| s.task_type == "physics").unwrap();
        assert_eq!(physics.deadline_ms, 1_000);
        assert_eq!(physics.constraints.min_cpu_cores, 4);

        let rt = subs.iter().find(|s| s.task_type == "raytracing").unwrap();
        assert_eq!(rt.deadline_ms, 6_000);
        assert!(rt.constraints.requires_gpu);

        // Fewer peers: only the leading subsystems are produced.
        assert_eq!(FunctionalSplitter.split(&t, 2).len(), 2);
    }

    #[test]
    fn pipeline_stages_chain_by_task_id() {
        let t = task("rendering", &[]);
        let subs = PipelineSplitter.split(&t, 3);
        assert_eq!(subs.len(), 3);

        assert_eq!(subs[0].params["depends_on"], Value::Null);
        assert_eq!(subs[1].params["depends_on"], json!("t1_stage_0"));
        assert_eq!(subs[2].params["depends_on"], json!("t1_stage_1"));
        assert_eq!(subs[2].params["stage"], json!("post_processing"));
    }

    #[test]
    fn hybrid_dispatches_on_task_type() {
        let splitter = HybridSplitter::new();

        assert_eq!(splitter.split(&task("game_frame", &[]), 5).len(), 5);
        assert_eq!(splitter.split(&task("rendering", &[]), 3).len(), 3);
        assert_eq!(
            splitter
                .split(&task("raytracing", &[("resolution", json!([100, 100]))]), 4)
                .len(),
            4
        );

        // Unsplittable type passes through untouched.
        let plain = splitter.split(&task("physics", &[]), 4);
        assert_eq!(plain.len(), 1);
        assert_eq!(plain[0].task_id, "t1");
    }
}
