//! Engine errors

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use thiserror::Error;

/// Errors from manager operations
#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("Automation not found: {0}")]
    NotFound(String),
}

/// Result type for manager operations
pub type AutomationResult<T> = Result<T, AutomationError>;

/// Errors that abort startup while building the dispatch index
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("Registry '{registry}' failed: {message}")]
    Registry { registry: String, message: String },

    #[error("Automation '{name}' has no usable key")]
    InvalidKey { name: String },
}

/// Marker error for an execution that stopped because it was cancelled
///
/// Returning this (or an error caused by it) from user code is not treated as
/// a failure.
#[derive(Debug, Clone, Copy, Error)]
#[error("execution cancelled")]
pub struct Cancelled;

/// A panic raised by user code, converted into an error
#[derive(Debug, Clone, Error)]
#[error("automation panicked: {0}")]
pub struct AutomationPanic(pub String);

impl AutomationPanic {
    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self(message)
    }
}

/// Whether an error chain contains [`Cancelled`]
pub fn is_cancellation(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| cause.is::<Cancelled>())
}

/// Run user code, turning a panic into an [`AutomationPanic`] error
pub(crate) async fn catch_panic<T, F>(future: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(AutomationPanic::from_payload(payload).into()),
    }
}
