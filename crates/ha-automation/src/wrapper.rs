//! Registered automation wrapper
//!
//! [`RegisteredAutomation`] gives every automation flavor the same execution
//! surface. Metadata and trigger ids are resolved once, when the wrapper is
//! created; failures there are recorded on the metadata instead of aborting
//! registration.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::Utc;
use ha_core::{EventTiming, StateChange};
use ha_trace::{TraceEvent, TraceStore};
use indexmap::IndexSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::automation::AutomationKind;
use crate::delay::SchedulingState;
use crate::error::{AutomationPanic, Cancelled};
use crate::executor::{AutomationExecutor, InlineExecutor};
use crate::failure::{FailureObserver, LoggingFailureObserver};
use crate::metadata::AutomationMetadata;
use crate::tracer::Tracer;

/// Services shared by every registered automation
pub struct ExecutionContext {
    pub tracer: Tracer,
    pub executor: Arc<dyn AutomationExecutor>,
}

impl ExecutionContext {
    pub fn new(tracer: Tracer, executor: Arc<dyn AutomationExecutor>) -> Self {
        Self { tracer, executor }
    }

    /// Inline execution with failures logged
    pub fn with_store(store: Arc<TraceStore>) -> Self {
        Self::new(
            Tracer::new(store, Arc::new(LoggingFailureObserver)),
            Arc::new(InlineExecutor),
        )
    }

    pub fn store(&self) -> &Arc<TraceStore> {
        self.tracer.store()
    }

    pub fn observer(&self) -> &Arc<dyn FailureObserver> {
        self.tracer.observer()
    }
}

/// One automation as held by the dispatch index
pub struct RegisteredAutomation {
    pub(crate) kind: AutomationKind,
    trigger_ids: Vec<String>,
    timings: EventTiming,
    metadata: RwLock<AutomationMetadata>,
    pub(crate) scheduling: Mutex<SchedulingState>,
    pub(crate) context: Arc<ExecutionContext>,
}

impl RegisteredAutomation {
    /// Wrap an automation registered from `source`
    ///
    /// The unique key is assigned later by the manager.
    pub fn new(kind: AutomationKind, source: &str, context: Arc<ExecutionContext>) -> Self {
        let type_name = kind.type_name();

        let (trigger_ids, trigger_error) = match guarded(|| kind.trigger_entity_ids()) {
            // One dispatch per event even when an entity is listed twice
            Ok(ids) => (ids.into_iter().collect::<IndexSet<_>>().into_iter().collect(), None),
            Err(e) => (Vec::new(), Some(format!("{:#}", e))),
        };

        let (metadata, metadata_error) = match guarded(|| kind.metadata()) {
            Ok(Some(metadata)) => (metadata, None),
            Ok(None) => (AutomationMetadata::new(short_type_name(type_name)), None),
            Err(e) => (
                AutomationMetadata::new(short_type_name(type_name)),
                Some(format!("{:#}", e)),
            ),
        };

        let metadata = AutomationMetadata {
            source: source.to_string(),
            automation_type: type_name.to_string(),
            is_delayable: kind.is_delayable(),
            user_metadata_error: metadata_error,
            user_trigger_error: trigger_error,
            given_key: String::new(),
            last_triggered: None,
            last_executed: None,
            next_scheduled: None,
            ..metadata
        };

        Self {
            timings: kind.event_timings(),
            kind,
            trigger_ids,
            metadata: RwLock::new(metadata),
            scheduling: Mutex::new(SchedulingState::default()),
            context,
        }
    }

    /// Unique key
    pub fn key(&self) -> String {
        self.read_metadata(|m| m.given_key.clone())
    }

    pub fn name(&self) -> String {
        self.read_metadata(|m| m.name.clone())
    }

    /// Snapshot of the current metadata
    pub fn metadata(&self) -> AutomationMetadata {
        self.read_metadata(Clone::clone)
    }

    pub fn kind(&self) -> &AutomationKind {
        &self.kind
    }

    pub fn trigger_entity_ids(&self) -> &[String] {
        &self.trigger_ids
    }

    pub fn event_timings(&self) -> EventTiming {
        self.timings
    }

    pub fn is_enabled(&self) -> bool {
        self.read_metadata(|m| m.enabled)
    }

    /// Whether this automation wants `change`
    pub fn accepts(&self, change: &StateChange) -> bool {
        self.timings.accepts(change.timing)
            && self.read_metadata(|m| {
                m.enabled && (m.trigger_on_bad_state || !change.new_state.is_bad())
            })
    }

    /// Flip the enabled flag; disabling cancels any pending run
    pub fn set_enabled(&self, enabled: bool) {
        self.update_metadata(|m| m.enabled = enabled);
        if !enabled {
            self.cancel_pending("automation disabled");
        }
    }

    pub(crate) fn assign_key(&self, key: String) {
        self.update_metadata(|m| m.given_key = key);
    }

    /// Report accessor failures recorded at wrap time
    pub(crate) fn report_authoring_errors(&self) {
        let metadata = self.metadata();
        let errors = [
            ("metadata", &metadata.user_metadata_error),
            ("trigger", &metadata.user_trigger_error),
        ];
        for (accessor, error) in errors {
            if let Some(message) = error {
                warn!(
                    automation_key = %metadata.given_key,
                    accessor,
                    error = %message,
                    "Automation accessor failed, using defaults"
                );
                let error = anyhow::anyhow!("{} accessor failed: {}", accessor, message);
                self.context.observer().on_unhandled_exception(&metadata, &error);
            }
        }
    }

    /// Handle a matching state change
    ///
    /// Runs inside a `Trigger` trace. Failures are recorded and reported there
    /// and never returned.
    pub async fn execute(self: &Arc<Self>, change: &StateChange) {
        self.update_metadata(|m| m.last_triggered = Some(Utc::now()));

        let metadata = self.metadata();
        let event = TraceEvent::trigger(&metadata.given_key, change);
        let this = Arc::clone(self);
        let change = change.clone();
        let work = async move { this.handle(&change).await };

        if let Err(e) = self.context.tracer.trace(event, &metadata, work).await {
            debug!(automation_key = %metadata.given_key, error = %e, "Trigger handling failed");
        }
    }

    async fn handle(self: &Arc<Self>, change: &StateChange) -> anyhow::Result<()> {
        match &self.kind {
            AutomationKind::Simple(automation) => {
                let automation = Arc::clone(automation);
                let change = change.clone();
                self.mark_executed();
                self.context
                    .executor
                    .run(Box::pin(async move {
                        automation.execute(&change, CancellationToken::new()).await
                    }))
                    .await
            }
            AutomationKind::Conditional(automation) => {
                let automation = Arc::clone(automation);
                self.evaluate_conditional(&automation, change).await
            }
            AutomationKind::Schedulable(automation) => {
                let automation = Arc::clone(automation);
                self.evaluate_schedulable(&automation, change).await
            }
        }
    }

    /// Run the delayed part of the automation through the executor
    ///
    /// A token cancelled before this point stops the run before user code is
    /// entered.
    pub(crate) async fn run_delayed(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        let Some(work) = self.kind.execute_delayed(cancel) else {
            return Ok(());
        };
        self.mark_executed();
        self.context.executor.run(work).await
    }

    fn mark_executed(&self) {
        self.update_metadata(|m| m.last_executed = Some(Utc::now()));
    }

    pub(crate) fn lock_scheduling(&self) -> MutexGuard<'_, SchedulingState> {
        self.scheduling.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_metadata<R>(&self, f: impl FnOnce(&AutomationMetadata) -> R) -> R {
        let metadata = self.metadata.read().unwrap_or_else(PoisonError::into_inner);
        f(&metadata)
    }

    pub(crate) fn update_metadata(&self, f: impl FnOnce(&mut AutomationMetadata)) {
        let mut metadata = self.metadata.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut metadata);
    }
}

impl std::fmt::Debug for RegisteredAutomation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredAutomation")
            .field("kind", &self.kind)
            .field("trigger_ids", &self.trigger_ids)
            .field("metadata", &self.metadata())
            .finish()
    }
}

/// Call a user accessor, turning a panic into an error
fn guarded<T>(f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(AutomationPanic::from_payload(payload).into()))
}

/// `my_crate::rules::PorchLight` -> `PorchLight`
fn short_type_name(type_name: &str) -> &str {
    let base = type_name.split('<').next().unwrap_or(type_name);
    base.rsplit("::").next().unwrap_or(base)
}
