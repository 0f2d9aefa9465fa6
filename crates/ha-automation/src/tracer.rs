//! Traced execution
//!
//! [`Tracer::trace`] runs a unit of work inside the span of a new trace so that
//! every log line it emits is captured, then records the outcome.

use std::future::Future;
use std::sync::Arc;

use ha_trace::{ExceptionInfo, ExceptionKind, TraceEvent, TraceStore};
use tracing::{info, Instrument};

use crate::error::{catch_panic, is_cancellation, AutomationPanic};
use crate::failure::FailureObserver;
use crate::metadata::AutomationMetadata;

/// Runs work inside a trace and reports its failures
pub struct Tracer {
    store: Arc<TraceStore>,
    observer: Arc<dyn FailureObserver>,
}

impl Tracer {
    pub fn new(store: Arc<TraceStore>, observer: Arc<dyn FailureObserver>) -> Self {
        Self { store, observer }
    }

    pub fn store(&self) -> &Arc<TraceStore> {
        &self.store
    }

    pub fn observer(&self) -> &Arc<dyn FailureObserver> {
        &self.observer
    }

    /// Run `work` inside a trace for `event`
    ///
    /// Cancellation counts as success. Any other error, or a panic, is
    /// attached to the trace, reported to the failure observer and returned.
    pub async fn trace<F>(
        &self,
        event: TraceEvent,
        metadata: &AutomationMetadata,
        work: F,
    ) -> anyhow::Result<()>
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        let scope = self.store.begin(event);
        let span = scope.span();

        let result = catch_panic(work).instrument(span.clone()).await;

        let result = match result {
            Err(e) if is_cancellation(&e) => {
                span.in_scope(|| info!(automation_key = %scope.automation_key, "Execution cancelled"));
                Ok(())
            }
            Err(e) => {
                let kind = if e.is::<AutomationPanic>() {
                    ExceptionKind::Panic
                } else {
                    ExceptionKind::Error
                };
                let causes = e.chain().skip(1).map(ToString::to_string).collect();
                self.store
                    .record_exception(&scope, ExceptionInfo::new(kind, e.to_string(), causes));
                span.in_scope(|| self.observer.on_unhandled_exception(metadata, &e));
                Err(e)
            }
            Ok(()) => Ok(()),
        };

        self.store.complete(scope);
        result
    }
}
