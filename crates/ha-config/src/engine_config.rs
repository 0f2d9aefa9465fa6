//! Engine configuration
//!
//! Parses the engine's YAML configuration file. Every section and every field
//! is optional; missing values fall back to the defaults below.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// Log levels accepted by `trace.global_log_level`
const LOG_LEVELS: [&str; 7] = [
    "debug", "info", "warning", "warn", "error", "critical", "fatal",
];

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Trace and log retention
    #[serde(default)]
    pub trace: TraceConfig,

    /// Entity health polling
    #[serde(default)]
    pub health: HealthConfig,

    /// Console logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Validate value ranges that serde cannot express
    pub fn validate(&self) -> ConfigResult<()> {
        self.trace.validate()?;
        self.health.validate()
    }
}

/// Trace store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceConfig {
    /// Number of traces kept per automation
    #[serde(default = "default_max_traces")]
    pub max_traces_per_automation: usize,

    /// Number of entries kept in each of the global, error and tracker logs
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,

    /// How long a finished trace stays active so late log lines can attach
    #[serde(default = "default_flush_delay_ms")]
    pub flush_delay_ms: u64,

    /// Records untouched for this long are dropped
    #[serde(default = "default_sliding_expiration_secs")]
    pub sliding_expiration_secs: u64,

    /// Directory for durable trace storage; in-memory only when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_dir: Option<PathBuf>,

    /// Minimum level for log lines captured outside of any trace
    #[serde(default = "default_global_log_level")]
    pub global_log_level: String,
}

fn default_max_traces() -> usize {
    50
}

fn default_max_log_entries() -> usize {
    200
}

fn default_flush_delay_ms() -> u64 {
    500
}

fn default_sliding_expiration_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_global_log_level() -> String {
    "info".to_string()
}

impl TraceConfig {
    /// Flush delay as a [`Duration`]
    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }

    /// Sliding expiration as a [`Duration`]
    pub fn sliding_expiration(&self) -> Duration {
        Duration::from_secs(self.sliding_expiration_secs)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.max_traces_per_automation == 0 {
            return Err(invalid(
                "trace.max_traces_per_automation",
                "must be at least 1",
            ));
        }
        if self.max_log_entries == 0 {
            return Err(invalid("trace.max_log_entries", "must be at least 1"));
        }
        if self.sliding_expiration_secs == 0 {
            return Err(invalid(
                "trace.sliding_expiration_secs",
                "must be at least 1",
            ));
        }
        let level = self.global_log_level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(invalid(
                "trace.global_log_level",
                &format!("unknown level '{}'", self.global_log_level),
            ));
        }
        Ok(())
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            max_traces_per_automation: default_max_traces(),
            max_log_entries: default_max_log_entries(),
            flush_delay_ms: default_flush_delay_ms(),
            sliding_expiration_secs: default_sliding_expiration_secs(),
            storage_dir: None,
            global_log_level: default_global_log_level(),
        }
    }
}

/// Health poller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Whether the poller runs at all
    #[serde(default = "default_health_enabled")]
    pub enabled: bool,

    /// Seconds between polls
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Entities not updated for this long are reported as unresponsive
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

fn default_health_enabled() -> bool {
    true
}

fn default_poll_interval_secs() -> u64 {
    300
}

fn default_stale_after_secs() -> u64 {
    24 * 60 * 60
}

impl HealthConfig {
    /// Poll interval as a [`Duration`]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Staleness threshold as a [`Duration`]
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.enabled && self.poll_interval_secs == 0 {
            return Err(invalid("health.poll_interval_secs", "must be at least 1"));
        }
        Ok(())
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: default_health_enabled(),
            poll_interval_secs: default_poll_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

/// Console logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive, overridden by `RUST_LOG`
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}
