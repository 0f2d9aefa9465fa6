//! Trace and log records

use chrono::{DateTime, Utc};
use ha_core::StateChange;
use serde::{Deserialize, Serialize};
use tracing::Level;

/// Name of the span opened around every traced execution
pub const TRACE_SPAN_NAME: &str = "automation_trace";

/// Log level for captured entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// Convert from tracing::Level
    pub fn from_tracing_level(level: Level) -> Self {
        match level {
            Level::DEBUG | Level::TRACE => LogLevel::Debug,
            Level::ERROR => LogLevel::Error,
            Level::INFO => LogLevel::Info,
            Level::WARN => LogLevel::Warning,
        }
    }

    /// Whether entries at this level also belong in the error log
    pub fn is_error_log_level(self) -> bool {
        self >= LogLevel::Warning
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ();

    /// Convert from string (case-insensitive)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            "critical" | "fatal" => Ok(LogLevel::Critical),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Critical => write!(f, "CRITICAL"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Error => write!(f, "ERROR"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARNING"),
        }
    }
}

/// A single captured log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogInfo {
    /// When the line was emitted
    pub timestamp: DateTime<Utc>,
    /// Severity
    pub level: LogLevel,
    /// Emitting target (module path)
    pub logger: String,
    /// Formatted message
    pub message: String,
    /// Structured fields other than the message
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub properties: serde_json::Map<String, serde_json::Value>,
    /// Names of the enclosing spans, outermost first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    /// Error text attached through an `error` or `exception` field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
}

impl LogInfo {
    /// Create a plain log line stamped with the current time
    pub fn new(level: LogLevel, logger: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            logger: logger.into(),
            message: message.into(),
            properties: serde_json::Map::new(),
            scopes: Vec::new(),
            exception: None,
        }
    }

    /// Attach a structured property
    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

/// Kind of trace event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TraceEventType {
    /// Execution started directly by a matching state change
    Trigger,
    /// Execution started by a timer that was scheduled earlier
    #[serde(rename = "Delayed-Execution")]
    DelayedExecution,
}

impl TraceEventType {
    /// Stable string form, also used as a span field value
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceEventType::Trigger => "Trigger",
            TraceEventType::DelayedExecution => "Delayed-Execution",
        }
    }
}

impl std::str::FromStr for TraceEventType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Trigger" => Ok(TraceEventType::Trigger),
            "Delayed-Execution" => Ok(TraceEventType::DelayedExecution),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for TraceEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a captured failure was a returned error or a panic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExceptionKind {
    Error,
    Panic,
}

/// A failure captured on a trace event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub kind: ExceptionKind,
    /// Top-level message
    pub message: String,
    /// Messages of the underlying causes, outermost first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<String>,
}

impl ExceptionInfo {
    pub fn new(kind: ExceptionKind, message: impl Into<String>, causes: Vec<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            causes,
        }
    }
}

/// Identity of one execution attempt
///
/// The same triple is recorded on the span opened around the execution, which
/// is how log lines find their way back to the trace they belong to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TraceScope {
    pub automation_key: String,
    pub event_type: TraceEventType,
    pub event_time: DateTime<Utc>,
}

impl TraceScope {
    /// Open the span that carries this scope's keys
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "automation_trace",
            automation_key = %self.automation_key,
            event_type = %self.event_type,
            event_time = self.event_time.timestamp_micros(),
        )
    }
}

/// The event that started an execution attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub event_time: DateTime<Utc>,
    pub event_type: TraceEventType,
    pub automation_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_change: Option<StateChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionInfo>,
}

impl TraceEvent {
    /// Event for an execution started by a state change
    pub fn trigger(automation_key: impl Into<String>, change: &StateChange) -> Self {
        Self::new(
            automation_key,
            TraceEventType::Trigger,
            Some(change.clone()),
        )
    }

    /// Event for an execution started by a timer
    pub fn delayed(automation_key: impl Into<String>) -> Self {
        Self::new(automation_key, TraceEventType::DelayedExecution, None)
    }

    fn new(
        automation_key: impl Into<String>,
        event_type: TraceEventType,
        state_change: Option<StateChange>,
    ) -> Self {
        Self {
            event_time: now_micros(),
            event_type,
            automation_key: automation_key.into(),
            state_change,
            exception: None,
        }
    }

    /// The scope triple identifying this event
    pub fn scope(&self) -> TraceScope {
        TraceScope {
            automation_key: self.automation_key.clone(),
            event_type: self.event_type,
            event_time: self.event_time,
        }
    }
}

/// A trace event together with the log lines emitted while it ran
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceData {
    pub event: TraceEvent,
    pub logs: Vec<LogInfo>,
}

/// Current time truncated to the microsecond precision carried by span fields
fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}
