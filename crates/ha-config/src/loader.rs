//! YAML configuration loader

use crate::engine_config::EngineConfig;
use crate::error::{ConfigError, ConfigResult};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Load the engine configuration from a YAML file
///
/// A missing file is not an error: the defaults are returned instead.
pub fn load_config(path: impl AsRef<Path>) -> ConfigResult<EngineConfig> {
    let path = path.as_ref();

    if !path.exists() {
        info!("Config file {:?} not found, using defaults", path);
        return Ok(EngineConfig::default());
    }

    debug!("Loading config file: {:?}", path);
    let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse(&content, path)
}

/// Load the engine configuration from a YAML string
pub fn load_config_str(content: &str) -> ConfigResult<EngineConfig> {
    parse(content, Path::new("<string>"))
}

fn parse(content: &str, source_path: &Path) -> ConfigResult<EngineConfig> {
    // An empty document deserializes to null, which serde rejects for a struct
    if content.trim().is_empty() {
        return Ok(EngineConfig::default());
    }

    let config: EngineConfig =
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseYaml {
            path: source_path.to_path_buf(),
            source: e,
        })?;

    config.validate()?;
    Ok(config)
}
