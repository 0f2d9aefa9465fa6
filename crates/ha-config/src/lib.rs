//! YAML configuration for the automation engine
//!
//! This crate loads the engine's configuration file: trace retention, the
//! entity health poller, and console logging.
//!
//! # Example
//!
//! ```ignore
//! use ha_config::load_config;
//!
//! let config = load_config("/config/engine.yaml")?;
//! println!("keeping {} traces", config.trace.max_traces_per_automation);
//! ```

mod engine_config;
mod error;
mod loader;

pub use engine_config::{EngineConfig, HealthConfig, LoggingConfig, TraceConfig};
pub use error::{ConfigError, ConfigResult};
pub use loader::{load_config, load_config_str};
