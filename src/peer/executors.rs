//! # Task Executors
//!
//! The single executor registry, keyed by documented task type names. The
//! coordinator validates `task_submit` messages against [`TASK_TYPES`] and
//! rejects anything else synchronously; peers execute through whatever
//! implementations are installed under those names.
//!
//! The built-in executors simulate their workloads (sleep scaled by the
//! declared complexity) and return structured JSON output bytes. They are
//! deterministic for identical inputs, which keeps their results cacheable.
//! Real deployments install their own [`TaskExecutor`] implementations.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

/// Documented task type names. The coordinator accepts exactly these.
pub const TASK_TYPES: &[&str] = &[
    "upscale",
    "raytracing",
    "physics",
    "ai_dialogue",
    "ai_pathfinding",
    "rendering",
    "audio",
];

/// Whether a task type is in the documented registry.
pub fn is_known_type(task_type: &str) -> bool {
    TASK_TYPES.contains(&task_type)
}

/// One pluggable task executor.
///
/// Implementations must capture their own errors and return `Err` rather than
/// panic; the peer loop converts errors into failed `task_result` messages.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, data: &[u8], params: &BTreeMap<String, Value>) -> Result<Vec<u8>>;
}

/// Registry mapping task type names to executors.
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    /// Empty registry; callers install their own executors.
    pub fn empty() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Registry preloaded with the built-in simulated executors for every
    /// documented task type.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.install("upscale", Arc::new(UpscaleExecutor));
        registry.install("raytracing", Arc::new(RayTracingExecutor));
        registry.install("physics", Arc::new(PhysicsExecutor));
        registry.install("ai_dialogue", Arc::new(DialogueExecutor));
        registry.install("ai_pathfinding", Arc::new(PathfindingExecutor));
        registry.install("rendering", Arc::new(RenderingExecutor));
        registry.install("audio", Arc::new(AudioExecutor));
        registry
    }

    /// Install (or replace) the executor for a task type.
    pub fn install(&mut self, task_type: &str, executor: Arc<dyn TaskExecutor>) {
        self.executors.insert(task_type.to_string(), executor);
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(task_type).cloned()
    }

    /// Execute a task through the installed table.
    pub async fn execute(
        &self,
        task_type: &str,
        data: &[u8],
        params: &BTreeMap<String, Value>,
    ) -> Result<Vec<u8>> {
        match self.get(task_type) {
            Some(executor) => executor.execute(data, params).await,
            None => Err(anyhow!("no executor installed for '{}'", task_type)),
        }
    }
}

fn param_u64(params: &BTreeMap<String, Value>, key: &str, default: u64) -> u64 {
    params.get(key).and_then(Value::as_u64).unwrap_or(default)
}

fn param_str<'a>(params: &'a BTreeMap<String, Value>, key: &str, default: &'a str) -> &'a str {
    params.get(key).and_then(Value::as_str).unwrap_or(default)
}

fn param_resolution(params: &BTreeMap<String, Value>) -> (u64, u64) {
    let res = params.get("resolution").and_then(Value::as_array);
    match res {
        Some(pair) if pair.len() == 2 => (
            pair[0].as_u64().unwrap_or(1920),
            pair[1].as_u64().unwrap_or(1080),
        ),
        _ => (1920, 1080),
    }
}

/// Frame upscaling. Simulated cost scales with the output pixel count.
struct UpscaleExecutor;

#[async_trait]
impl TaskExecutor for UpscaleExecutor {
    async fn execute(&self, data: &[u8], params: &BTreeMap<String, Value>) -> Result<Vec<u8>> {
        let (width, height) = param_resolution(params);
        let quality = param_str(params, "quality", "balanced");
        let cost_ms = match quality {
            "fast" => 5,
            "quality" => 40,
            _ => 15,
        } + (width * height) / 500_000;
        tokio::time::sleep(Duration::from_millis(cost_ms)).await;

        Ok(serde_json::to_vec(&json!({
            "type": "upscale",
            "input_bytes": data.len(),
            "output_res": [width, height],
            "quality": quality,
        }))?)
    }
}

/// Ray tracing. Simulated cost scales with complexity and light count; tiles
/// carry their bounds through to the output so results can be reassembled.
struct RayTracingExecutor;

#[async_trait]
impl TaskExecutor for RayTracingExecutor {
    async fn execute(&self, _data: &[u8], params: &BTreeMap<String, Value>) -> Result<Vec<u8>> {
        let complexity = param_u64(params, "complexity", 100);
        let num_lights = param_u64(params, "num_lights", 1);
        let (width, height) = param_resolution(params);

        let trace_ms = 30 + complexity / 2 + num_lights * 10;
        tokio::time::sleep(Duration::from_millis(trace_ms)).await;

        let rays_per_pixel = (complexity / 50).max(1);
        Ok(serde_json::to_vec(&json!({
            "type": "raytracing",
            "resolution": [width, height],
            "rays_traced": width * height * rays_per_pixel,
            "samples_per_pixel": rays_per_pixel,
            "bounce_count": (complexity / 25).min(4),
            "tile_bounds": params.get("tile_bounds"),
        }))?)
    }
}

/// Rigid body physics. Deterministic Euler integration over simple falling
/// bodies; cost scales with object count and step count.
struct PhysicsExecutor;

#[async_trait]
impl TaskExecutor for PhysicsExecutor {
    async fn execute(&self, _data: &[u8], params: &BTreeMap<String, Value>) -> Result<Vec<u8>> {
        let num_objects = param_u64(params, "num_objects", 10);
        let steps = param_u64(params, "steps", 1);
        let timestep = params
            .get("timestep")
            .and_then(Value::as_f64)
            .unwrap_or(0.016);

        tokio::time::sleep(Duration::from_millis(5 * (num_objects / 10).max(1) * steps)).await;

        let mut objects = Vec::with_capacity(num_objects as usize);
        for i in 0..num_objects {
            // Bodies start on a grid and fall under gravity.
            let t = timestep * steps as f64;
            let x = (i % 10) as f64;
            let z = (i / 10) as f64;
            let y0 = 20.0;
            objects.push(json!({
                "id": i,
                "position": [x, y0 - 0.5 * 9.81 * t * t, z],
                "velocity": [0.0, -9.81 * t, 0.0],
            }));
        }

        Ok(serde_json::to_vec(&json!({
            "type": "physics",
            "objects": objects,
            "timestep": timestep,
            "steps_computed": steps,
        }))?)
    }
}

/// NPC dialogue via keyword matching. Response choice is a deterministic
/// function of the player input, so identical prompts cache cleanly.
struct DialogueExecutor;

#[async_trait]
impl TaskExecutor for DialogueExecutor {
    async fn execute(&self, _data: &[u8], params: &BTreeMap<String, Value>) -> Result<Vec<u8>> {
        let player_input = param_str(params, "player_input", "Hello").to_string();
        let npc_name = param_str(params, "npc_name", "Guard").to_string();
        let personality = param_str(params, "personality", "friendly").to_string();

        tokio::time::sleep(Duration::from_millis(80)).await;

        let lower = player_input.to_lowercase();
        let pool: &[&str] = if lower.contains("hello") || lower.contains("hi") {
            &[
                "Greetings, traveler! I am {npc}.",
                "Well met! The name's {npc}.",
                "Hail, stranger! {npc} at your service.",
            ]
        } else if lower.contains("help") {
            &[
                "I can point you toward the market if you're looking to trade.",
                "The tavern is down the road if you need rest.",
                "Be careful near the forest.",
            ]
        } else if lower.contains("quest") || lower.contains("task") {
            &[
                "I do have a task that needs doing, if you're interested...",
                "There's been trouble with bandits on the north road.",
                "The mayor has been looking for capable adventurers.",
            ]
        } else {
            &[
                "I'm {npc}. What brings you here?",
                "Is there something I can help you with?",
                "Speak your mind, friend.",
            ]
        };

        let pick = player_input
            .bytes()
            .fold(0usize, |h, b| h.wrapping_mul(31).wrapping_add(b as usize))
            % pool.len();
        let mut dialogue = pool[pick].replace("{npc}", &npc_name);
        match personality.as_str() {
            "grumpy" => dialogue.push_str(" Now leave me be."),
            "cheerful" => dialogue.push_str(" Have a wonderful day!"),
            _ => {}
        }

        Ok(serde_json::to_vec(&json!({
            "type": "ai_dialogue",
            "dialogue": dialogue,
            "emotion": if personality == "friendly" { "neutral" } else { personality.as_str() },
            "animation": "talk",
        }))?)
    }
}

/// Grid pathfinding: greedy stepping toward the goal, bounded at 100 steps.
struct PathfindingExecutor;

#[async_trait]
impl TaskExecutor for PathfindingExecutor {
    async fn execute(&self, _data: &[u8], params: &BTreeMap<String, Value>) -> Result<Vec<u8>> {
        let point = |key: &str, default: (i64, i64)| -> (i64, i64) {
            params
                .get(key)
                .and_then(Value::as_array)
                .filter(|p| p.len() == 2)
                .map(|p| {
                    (
                        p[0].as_i64().unwrap_or(default.0),
                        p[1].as_i64().unwrap_or(default.1),
                    )
                })
                .unwrap_or(default)
        };
        let start = point("start", (0, 0));
        let goal = point("goal", (10, 10));

        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut path = Vec::new();
        let mut current = start;
        while current != goal && path.len() < 100 {
            current.0 += (goal.0 - current.0).signum();
            current.1 += (goal.1 - current.1).signum();
            path.push(json!([current.0, current.1]));
        }

        Ok(serde_json::to_vec(&json!({
            "type": "ai_pathfinding",
            "path": path,
            "distance": path.len(),
            "reached": current == goal,
        }))?)
    }
}

/// Rendering pipeline stage (geometry, lighting or post_processing).
struct RenderingExecutor;

#[async_trait]
impl TaskExecutor for RenderingExecutor {
    async fn execute(&self, _data: &[u8], params: &BTreeMap<String, Value>) -> Result<Vec<u8>> {
        let stage = param_str(params, "stage", "geometry").to_string();
        let (width, height) = param_resolution(params);

        tokio::time::sleep(Duration::from_millis(20)).await;

        Ok(serde_json::to_vec(&json!({
            "type": "rendering",
            "stage": stage,
            "resolution": [width, height],
            "depends_on": params.get("depends_on"),
        }))?)
    }
}

/// Audio mixing for one frame of a compound workload.
struct AudioExecutor;

#[async_trait]
impl TaskExecutor for AudioExecutor {
    async fn execute(&self, _data: &[u8], params: &BTreeMap<String, Value>) -> Result<Vec<u8>> {
        let channels = param_u64(params, "channels", 2);
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(serde_json::to_vec(&json!({
            "type": "audio",
            "channels": channels,
            "mixed": true,
        }))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_covers_every_documented_type() {
        let registry = ExecutorRegistry::builtin();
        for task_type in TASK_TYPES {
            assert!(
                registry.get(task_type).is_some(),
                "missing executor for {}",
                task_type
            );
        }
        assert!(is_known_type("physics"));
        assert!(!is_known_type("teleportation"));
    }

    #[tokio::test]
    async fn unknown_type_fails_without_executing() {
        let registry = ExecutorRegistry::builtin();
        let err = registry
            .execute("teleportation", b"", &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("teleportation"));
    }

    #[tokio::test]
    async fn pathfinding_reaches_the_goal() {
        let registry = ExecutorRegistry::builtin();
        let mut params = BTreeMap::new();
        params.insert("start".to_string(), json!([0, 0]));
        params.insert("goal".to_string(), json!([3, 5]));

        let out = registry
            .execute("ai_pathfinding", b"", &params)
            .await
            .unwrap();
        let parsed: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed["reached"], true);
        assert_eq!(parsed["distance"], 5);
    }

    #[tokio::test]
    async fn dialogue_is_deterministic_per_input() {
        let registry = ExecutorRegistry::builtin();
        let mut params = BTreeMap::new();
        params.insert("player_input".to_string(), json!("hello there"));
        params.insert("npc_name".to_string(), json!("Mira"));

        let a = registry.execute("ai_dialogue", b"", &params).await.unwrap();
        let b = registry.execute("ai_dialogue", b"", &params).await.unwrap();
        assert_eq!(a, b);

        let parsed: Value = serde_json::from_slice(&a).unwrap();
        assert!(parsed["dialogue"].as_str().unwrap().contains("Mira"));
    }

    #[tokio::test]
    async fn physics_output_matches_requested_object_count() {
        let registry = ExecutorRegistry::builtin();
        let mut params = BTreeMap::new();
        params.insert("num_objects".to_string(), json!(7));

        let out = registry.execute("physics", b"", &params).await.unwrap();
        let parsed: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed["objects"].as_array().unwrap().len(), 7);
    }
}
