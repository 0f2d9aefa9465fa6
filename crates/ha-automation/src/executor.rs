//! Execution strategies for user code

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::Instrument;

use crate::error::{AutomationPanic, Cancelled};

/// Decides where an automation's `execute` runs
#[async_trait]
pub trait AutomationExecutor: Send + Sync {
    async fn run(&self, work: BoxFuture<'static, anyhow::Result<()>>) -> anyhow::Result<()>;
}

/// Runs user code to completion on the calling task
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

#[async_trait]
impl AutomationExecutor for InlineExecutor {
    async fn run(&self, work: BoxFuture<'static, anyhow::Result<()>>) -> anyhow::Result<()> {
        work.await
    }
}

/// Runs user code on its own tokio task and waits for it
///
/// The task carries the current span, so its log lines land in the trace of
/// the execution that started it.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpawningExecutor;

#[async_trait]
impl AutomationExecutor for SpawningExecutor {
    async fn run(&self, work: BoxFuture<'static, anyhow::Result<()>>) -> anyhow::Result<()> {
        match tokio::spawn(work.in_current_span()).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(AutomationPanic::from_payload(e.into_panic()).into()),
            Err(_) => Err(Cancelled.into()),
        }
    }
}
