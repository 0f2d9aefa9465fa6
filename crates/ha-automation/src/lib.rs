//! Automation Engine
//!
//! Dispatches classified state changes to registered automations, runs the
//! delay state machine for automations that wait or schedule themselves, and
//! records a trace of every execution.
//!
//! # Architecture
//!
//! ```text
//! StateChange → AutomationManager → RegisteredAutomation → Tracer → user code
//!                                         │
//!                                         └─ delay state machine → timer task
//! ```
//!
//! # Key Types
//!
//! - [`Automation`], [`ConditionalAutomation`], [`SchedulableAutomation`] - user logic
//! - [`AutomationKind`] - one registered automation of any flavor
//! - [`RegisteredAutomation`] - wrapper owning metadata and scheduling state
//! - [`AutomationManager`] - dispatch index built from [`AutomationRegistry`]s
//! - [`HealthPoller`] - reports unresponsive tracked entities

pub mod automation;
mod delay;
pub mod error;
pub mod executor;
pub mod failure;
pub mod health;
pub mod manager;
pub mod metadata;
pub mod tracer;
pub mod wrapper;

pub use automation::{
    Automation, AutomationKind, AutomationMeta, ConditionalAutomation, SchedulableAutomation,
};
pub use error::{
    is_cancellation, AutomationError, AutomationPanic, AutomationResult, Cancelled,
    RegistrationError,
};
pub use executor::{AutomationExecutor, InlineExecutor, SpawningExecutor};
pub use failure::{ChannelFailureObserver, FailureObserver, FailureReport, LoggingFailureObserver};
pub use health::{EntityProblem, EntityStateProvider, HealthPoller, HealthReport};
pub use manager::{AutomationManager, AutomationRegistry, Registrar};
pub use metadata::{clean_key, AutomationMetadata};
pub use tracer::Tracer;
pub use wrapper::{ExecutionContext, RegisteredAutomation};
