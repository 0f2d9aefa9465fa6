//! Failure observation
//!
//! Errors raised by user code never escape the engine. They are recorded on
//! the trace and handed to a [`FailureObserver`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::error;

use crate::metadata::AutomationMetadata;

/// Receives every unhandled error raised by user code
pub trait FailureObserver: Send + Sync {
    fn on_unhandled_exception(&self, metadata: &AutomationMetadata, error: &anyhow::Error);
}

/// Logs failures at error level
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingFailureObserver;

impl FailureObserver for LoggingFailureObserver {
    fn on_unhandled_exception(&self, metadata: &AutomationMetadata, error: &anyhow::Error) {
        error!(
            automation_key = %metadata.given_key,
            automation = %metadata.name,
            error = %format!("{:#}", error),
            "Unhandled automation error"
        );
    }
}

/// A failure as delivered by [`ChannelFailureObserver`]
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub automation_key: String,
    pub automation_name: String,
    /// Error message including its causes
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Forwards failures to an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelFailureObserver {
    tx: mpsc::UnboundedSender<FailureReport>,
}

impl ChannelFailureObserver {
    pub fn new(tx: mpsc::UnboundedSender<FailureReport>) -> Self {
        Self { tx }
    }

    /// Create an observer together with the receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<FailureReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl FailureObserver for ChannelFailureObserver {
    fn on_unhandled_exception(&self, metadata: &AutomationMetadata, error: &anyhow::Error) {
        let report = FailureReport {
            automation_key: metadata.given_key.clone(),
            automation_name: metadata.name.clone(),
            message: format!("{:#}", error),
            at: Utc::now(),
        };
        // Receiver gone means nobody is listening any more
        let _ = self.tx.send(report);
    }
}
