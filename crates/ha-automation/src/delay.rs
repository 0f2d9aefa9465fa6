//! Delay state machine for conditional and schedulable automations
//!
//! Each delayable wrapper owns one [`SchedulingState`] behind a mutex. Every
//! decision about the pending timer (start it, keep it, replace it, cancel it)
//! is taken while holding that mutex, so at most one timer is ever pending.
//!
//! A timer is a tokio task that sleeps until its target and then runs the
//! automation inside a `Delayed-Execution` trace. Cancelling a timer signals
//! its token and clears the state in the same critical section.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use ha_core::StateChange;
use ha_trace::TraceEvent;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::automation::{ConditionalAutomation, SchedulableAutomation};
use crate::error::catch_panic;
use crate::wrapper::RegisteredAutomation;

/// The timer currently pending for a wrapper
#[derive(Debug)]
pub(crate) struct PendingTimer {
    token: CancellationToken,
    target: DateTime<Utc>,
    /// Distinguishes this timer from later ones in the same wrapper
    generation: u64,
}

/// Scheduling state of one delayable wrapper
#[derive(Debug, Default)]
pub(crate) struct SchedulingState {
    pending: Option<PendingTimer>,
    next_generation: u64,
}

/// Outcome of a schedulable decision taken under the lock
#[derive(Debug, PartialEq, Eq)]
enum Decision {
    Keep,
    Scheduled,
    RunNow,
    DropPast,
}

impl RegisteredAutomation {
    /// Target of the pending timer, if any
    pub fn pending_target(&self) -> Option<DateTime<Utc>> {
        self.lock_scheduling().pending.as_ref().map(|p| p.target)
    }

    pub fn has_pending(&self) -> bool {
        self.lock_scheduling().pending.is_some()
    }

    /// Cancel the pending timer; returns whether one was pending
    pub(crate) fn cancel_pending(&self, reason: &str) -> bool {
        let mut state = self.lock_scheduling();
        let Some(pending) = state.pending.take() else {
            return false;
        };
        pending.token.cancel();
        self.update_metadata(|m| m.next_scheduled = None);
        drop(state);

        info!(
            automation_key = %self.key(),
            target = %pending.target,
            reason,
            "Cancelled pending execution"
        );
        true
    }

    pub(crate) async fn evaluate_conditional(
        self: &Arc<Self>,
        automation: &Arc<dyn ConditionalAutomation>,
        change: &StateChange,
    ) -> anyhow::Result<()> {
        let holds = match catch_panic(automation.continues_to_be_true(change)).await {
            Ok(holds) => holds,
            Err(e) => {
                let fallback = automation.should_execute_on_continue_error();
                warn!(
                    error = %format!("{:#}", e),
                    fallback,
                    "Condition check failed, using fallback"
                );
                fallback
            }
        };

        if !holds {
            self.cancel_pending("condition no longer true");
            return Ok(());
        }

        let delay = automation.for_duration();
        if delay.is_zero() {
            debug!("Condition holds, running immediately");
            return self.run_delayed(CancellationToken::new()).await;
        }

        let mut state = self.lock_scheduling();
        if let Some(pending) = &state.pending {
            debug!(target_time = %pending.target, "Execution already pending");
            return Ok(());
        }
        let target = Utc::now() + chrono::Duration::from_std(delay)?;
        self.arm(&mut state, target, delay)
    }

    pub(crate) async fn evaluate_schedulable(
        self: &Arc<Self>,
        automation: &Arc<dyn SchedulableAutomation>,
        change: &StateChange,
    ) -> anyhow::Result<()> {
        let next = match catch_panic(automation.next_scheduled(change)).await {
            Ok(next) => next,
            Err(e) => {
                let fallback = automation.should_execute_on_continue_error();
                warn!(
                    error = %format!("{:#}", e),
                    fallback,
                    "Schedule calculation failed, using fallback"
                );
                if fallback {
                    return Ok(());
                }
                None
            }
        };

        let Some(target) = next else {
            self.cancel_pending("no next run");
            return Ok(());
        };

        let decision = {
            let mut state = self.lock_scheduling();
            let keep = match &state.pending {
                Some(pending) => !automation.is_reschedulable() || pending.target == target,
                None => false,
            };

            if keep {
                Decision::Keep
            } else {
                if let Some(previous) = state.pending.take() {
                    previous.token.cancel();
                    self.update_metadata(|m| m.next_scheduled = None);
                    debug!(previous = %previous.target, "Replacing pending execution");
                }

                let now = Utc::now();
                if target < now {
                    if automation.should_execute_past_events() {
                        Decision::RunNow
                    } else {
                        Decision::DropPast
                    }
                } else {
                    let delay = (target - now).to_std().unwrap_or(Duration::ZERO);
                    self.arm(&mut state, target, delay)?;
                    Decision::Scheduled
                }
            }
        };

        match decision {
            Decision::RunNow => {
                debug!(target_time = %target, "Scheduled time already passed, running now");
                self.run_delayed(CancellationToken::new()).await
            }
            Decision::DropPast => {
                debug!(target_time = %target, "Scheduled time already passed, skipping");
                Ok(())
            }
            Decision::Keep | Decision::Scheduled => Ok(()),
        }
    }

    /// Start a timer; caller holds the scheduling lock and nothing is pending
    ///
    /// The state is only recorded once the timer task is spawned, so without
    /// a tokio runtime this fails and leaves nothing pending.
    fn arm(
        self: &Arc<Self>,
        state: &mut SchedulingState,
        target: DateTime<Utc>,
        delay: Duration,
    ) -> anyhow::Result<()> {
        let runtime = Handle::try_current().context("no tokio runtime to run the timer on")?;

        let token = CancellationToken::new();
        let generation = state.next_generation;
        state.next_generation += 1;

        let this = Arc::clone(self);
        let cancelled = token.clone();
        let timer = token.clone();
        runtime.spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => this.fire(generation, timer).await,
            }
        });

        // The task cannot observe `pending` before the caller releases the lock
        state.pending = Some(PendingTimer {
            token,
            target,
            generation,
        });
        self.update_metadata(|m| m.next_scheduled = Some(target));

        info!(target_time = %target, delay_ms = delay.as_millis() as u64, "Scheduled execution");
        Ok(())
    }

    /// Timer elapsed: run the automation and clear the state it owns
    async fn fire(self: Arc<Self>, generation: u64, token: CancellationToken) {
        let still_pending = self
            .lock_scheduling()
            .pending
            .as_ref()
            .is_some_and(|p| p.generation == generation && !token.is_cancelled());
        if !still_pending {
            return;
        }

        let metadata = self.metadata();
        let event = TraceEvent::delayed(&metadata.given_key);
        let this = Arc::clone(&self);
        let work = async move { this.run_delayed(token).await };

        if let Err(e) = self.context.tracer.trace(event, &metadata, work).await {
            debug!(automation_key = %metadata.given_key, error = %e, "Delayed execution failed");
        }

        let mut state = self.lock_scheduling();
        if state
            .pending
            .as_ref()
            .is_some_and(|p| p.generation == generation)
        {
            state.pending = None;
            self.update_metadata(|m| m.next_scheduled = None);
        }
    }
}
