// Engine configuration loading for the Gradus worker
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;
use tracing::info;

use gradus_common::config::EngineConfig;

const DEFAULT_CONFIG_PATH: &str = "config/engine.json";

/// Resolve the engine configuration. An explicit GRADUS_CONFIG path
/// must exist; the default path is optional; with neither, the
/// built-in defaults apply.
pub fn load() -> Result<EngineConfig> {
    if let Ok(path) = std::env::var("GRADUS_CONFIG") {
        return load_file(Path::new(&path));
    }
    let default_path = Path::new(DEFAULT_CONFIG_PATH);
    if default_path.exists() {
        return load_file(default_path);
    }
    info!("No engine config file found, using built-in defaults");
    Ok(EngineConfig::default())
}

/// Load engine configuration from a JSON file. Missing fields fall
/// back to their defaults.
pub fn load_file(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        bail!("Engine config file not found: {}", path.display());
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let config: EngineConfig = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    Ok(config)
}
