//! Automation traits
//!
//! User logic comes in three flavors:
//!
//! - [`Automation`] runs on every matching state change
//! - [`ConditionalAutomation`] runs once its condition has held for a fixed
//!   duration
//! - [`SchedulableAutomation`] runs at an instant it computes itself
//!
//! All three share [`AutomationMeta`]. Registered automations are stored as an
//! [`AutomationKind`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ha_core::{EventTiming, StateChange};
use tokio_util::sync::CancellationToken;

use crate::metadata::AutomationMetadata;

/// Accessors shared by every automation flavor
pub trait AutomationMeta: Send + Sync {
    /// Entities whose state changes are dispatched to this automation
    fn trigger_entity_ids(&self) -> anyhow::Result<Vec<String>>;

    /// Metadata supplied by the automation; derived from the type when `None`
    fn metadata(&self) -> anyhow::Result<Option<AutomationMetadata>> {
        Ok(None)
    }

    /// Event timings this automation accepts
    fn event_timings(&self) -> EventTiming {
        EventTiming::POST_STARTUP
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Runs on every matching state change
#[async_trait]
pub trait Automation: AutomationMeta {
    async fn execute(&self, change: &StateChange, cancel: CancellationToken)
        -> anyhow::Result<()>;
}

/// Runs once its condition has stayed true for [`for_duration`]
///
/// A false result before the duration elapses cancels the pending run.
/// Repeated true results while a run is pending are collapsed into it.
///
/// [`for_duration`]: ConditionalAutomation::for_duration
#[async_trait]
pub trait ConditionalAutomation: AutomationMeta {
    async fn continues_to_be_true(&self, change: &StateChange) -> anyhow::Result<bool>;

    /// Zero runs immediately on a true result
    fn for_duration(&self) -> Duration;

    /// Result assumed when the condition check fails
    fn should_execute_on_continue_error(&self) -> bool {
        false
    }

    async fn execute(&self, cancel: CancellationToken) -> anyhow::Result<()>;
}

/// Runs at an instant computed from each state change
#[async_trait]
pub trait SchedulableAutomation: AutomationMeta {
    /// `None` means do not run, cancelling any pending run
    async fn next_scheduled(&self, change: &StateChange)
        -> anyhow::Result<Option<DateTime<Utc>>>;

    /// Whether a new instant replaces a pending one
    fn is_reschedulable(&self) -> bool {
        false
    }

    /// Whether an instant already in the past runs immediately or is dropped
    fn should_execute_past_events(&self) -> bool {
        false
    }

    /// When true, a failed `next_scheduled` leaves any pending run in place;
    /// when false it cancels it
    fn should_execute_on_continue_error(&self) -> bool {
        false
    }

    async fn execute(&self, cancel: CancellationToken) -> anyhow::Result<()>;
}

/// A registered automation of any flavor
#[derive(Clone)]
pub enum AutomationKind {
    Simple(Arc<dyn Automation>),
    Conditional(Arc<dyn ConditionalAutomation>),
    Schedulable(Arc<dyn SchedulableAutomation>),
}

macro_rules! each_kind {
    ($kind:expr, $inner:ident => $body:expr) => {
        match $kind {
            AutomationKind::Simple($inner) => $body,
            AutomationKind::Conditional($inner) => $body,
            AutomationKind::Schedulable($inner) => $body,
        }
    };
}

impl AutomationKind {
    pub fn simple(automation: impl Automation + 'static) -> Self {
        Self::Simple(Arc::new(automation))
    }

    pub fn conditional(automation: impl ConditionalAutomation + 'static) -> Self {
        Self::Conditional(Arc::new(automation))
    }

    pub fn schedulable(automation: impl SchedulableAutomation + 'static) -> Self {
        Self::Schedulable(Arc::new(automation))
    }

    /// Conditional and schedulable automations go through the delay state machine
    pub fn is_delayable(&self) -> bool {
        !matches!(self, AutomationKind::Simple(_))
    }

    pub fn trigger_entity_ids(&self) -> anyhow::Result<Vec<String>> {
        each_kind!(self, inner => inner.trigger_entity_ids())
    }

    pub fn metadata(&self) -> anyhow::Result<Option<AutomationMetadata>> {
        each_kind!(self, inner => inner.metadata())
    }

    pub fn event_timings(&self) -> EventTiming {
        each_kind!(self, inner => inner.event_timings())
    }

    pub fn type_name(&self) -> &'static str {
        each_kind!(self, inner => inner.type_name())
    }

    /// Start the delayed part of a conditional or schedulable automation
    pub(crate) fn execute_delayed(
        &self,
        cancel: CancellationToken,
    ) -> Option<futures::future::BoxFuture<'static, anyhow::Result<()>>> {
        match self {
            AutomationKind::Simple(_) => None,
            AutomationKind::Conditional(inner) => {
                let inner = Arc::clone(inner);
                Some(Box::pin(async move { inner.execute(cancel).await }))
            }
            AutomationKind::Schedulable(inner) => {
                let inner = Arc::clone(inner);
                Some(Box::pin(async move { inner.execute(cancel).await }))
            }
        }
    }
}

impl std::fmt::Debug for AutomationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let flavor = match self {
            AutomationKind::Simple(_) => "Simple",
            AutomationKind::Conditional(_) => "Conditional",
            AutomationKind::Schedulable(_) => "Schedulable",
        };
        f.debug_tuple(flavor).field(&self.type_name()).finish()
    }
}
