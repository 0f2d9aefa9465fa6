//! Error types for configuration loading

use std::path::PathBuf;
use thiserror::Error;

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read engine config {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("engine config {path} is not valid YAML: {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// A value parsed but is out of range
    #[error("config value '{key}' {reason}")]
    InvalidValue { key: String, reason: String },
}
