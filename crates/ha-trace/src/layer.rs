//! `tracing` layer routing log events into the trace store
//!
//! Spans named [`TRACE_SPAN_NAME`] carry the key of the trace they belong to.
//! Any event emitted inside such a span, including from tasks spawned with
//! `.in_current_span()`, is appended to that trace. Events outside of every
//! trace span go to the global and error logs.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use crate::model::{LogInfo, LogLevel, TraceEventType, TraceScope, TRACE_SPAN_NAME};
use crate::store::TraceStore;

/// Targets never captured, so that the store's own diagnostics cannot feed
/// back into it
const STORE_TARGETS: [&str; 2] = ["ha_trace::store", "ha_trace::cache"];

/// Layer capturing events into a [`TraceStore`]
#[derive(Clone)]
pub struct TraceLayer {
    store: Arc<TraceStore>,
}

impl TraceLayer {
    pub fn new(store: Arc<TraceStore>) -> Self {
        Self { store }
    }
}

impl fmt::Debug for TraceLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceLayer").finish()
    }
}

impl<S> Layer<S> for TraceLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        if attrs.metadata().name() != TRACE_SPAN_NAME {
            return;
        }

        let mut visitor = ScopeVisitor::default();
        attrs.record(&mut visitor);

        if let (Some(scope), Some(span)) = (visitor.into_scope(), ctx.span(id)) {
            span.extensions_mut().insert(scope);
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if STORE_TARGETS
            .iter()
            .any(|target| metadata.target().starts_with(target))
        {
            return;
        }

        let mut visitor = LogVisitor::default();
        event.record(&mut visitor);

        let mut log = LogInfo::new(
            LogLevel::from_tracing_level(*metadata.level()),
            metadata.target(),
            visitor.message.unwrap_or_default(),
        );
        log.properties = visitor.properties;
        log.exception = visitor.exception;

        let mut trace_scope = None;
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope.from_root() {
                log.scopes.push(span.name().to_string());
                // Innermost trace span wins
                if let Some(found) = span.extensions().get::<TraceScope>() {
                    trace_scope = Some(found.clone());
                }
            }
        }

        match trace_scope {
            Some(scope) => self.store.append_log(&scope, log),
            None => self.store.record_untraced(log),
        }
    }
}

/// Reads the trace key fields recorded on a trace span
#[derive(Default)]
struct ScopeVisitor {
    automation_key: Option<String>,
    event_type: Option<TraceEventType>,
    event_time: Option<DateTime<Utc>>,
}

impl ScopeVisitor {
    fn into_scope(self) -> Option<TraceScope> {
        Some(TraceScope {
            automation_key: self.automation_key?,
            event_type: self.event_type?,
            event_time: self.event_time?,
        })
    }

    fn set_text(&mut self, field: &Field, value: String) {
        match field.name() {
            "automation_key" => self.automation_key = Some(value),
            "event_type" => self.event_type = value.parse().ok(),
            _ => {}
        }
    }
}

impl Visit for ScopeVisitor {
    fn record_i64(&mut self, field: &Field, value: i64) {
        if field.name() == "event_time" {
            self.event_time = DateTime::from_timestamp_micros(value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.set_text(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.set_text(field, format!("{:?}", value));
    }
}

/// Collects the message and structured fields of an event
#[derive(Default)]
struct LogVisitor {
    message: Option<String>,
    exception: Option<String>,
    properties: serde_json::Map<String, Value>,
}

impl LogVisitor {
    fn set(&mut self, field: &Field, value: Value) {
        match field.name() {
            "message" => self.message = Some(value_text(value)),
            "error" | "exception" => self.exception = Some(value_text(value)),
            name => {
                self.properties.insert(name.to_string(), value);
            }
        }
    }
}

fn value_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

impl Visit for LogVisitor {
    fn record_i64(&mut self, field: &Field, value: i64) {
        self.set(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.set(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.set(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.set(field, Value::from(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.set(field, Value::from(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        let mut text = value.to_string();
        let mut source = value.source();
        while let Some(cause) = source {
            text.push_str(": ");
            text.push_str(&cause.to_string());
            source = cause.source();
        }
        self.set(field, Value::from(text));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.set(field, Value::from(format!("{:?}", value)));
    }
}
