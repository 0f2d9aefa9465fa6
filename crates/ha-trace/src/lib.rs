//! Automation trace and log storage
//!
//! Every execution of an automation is recorded as a trace: the event that
//! started it, any failure, and the log lines emitted while it ran. Log lines
//! are captured from `tracing` by [`TraceLayer`] and matched to their trace
//! through the span opened with [`TraceScope::span`].

pub mod cache;
pub mod layer;
pub mod model;
pub mod store;

pub use cache::{CacheError, CacheResult, FileCache, MemoryCache, TraceCache};
pub use layer::TraceLayer;
pub use model::{
    ExceptionInfo, ExceptionKind, LogInfo, LogLevel, TraceData, TraceEvent, TraceEventType,
    TraceScope, TRACE_SPAN_NAME,
};
pub use store::{StoreSettings, TraceStore};
