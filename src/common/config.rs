//! TOML configuration parsing shared by the three binaries.

use anyhow::Result;
use serde::Deserialize;
use std::fs;

/// Read the TOML file at `path` and parse it into any deserializable
/// configuration struct.
///
/// Both the read and the parse error bubble up through `anyhow`, so a binary
/// handed a bad config path or malformed TOML fails startup with a nonzero
/// exit instead of limping along on defaults.
///
/// ```ignore
/// let config: CoordinatorConfig = load_config("config/coordinator.toml")?;
/// ```
pub fn load_config<T>(path: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let content = fs::read_to_string(path)?;
    let config: T = toml::from_str(&content)?;
    Ok(config)
}
