//! Entity health poller
//!
//! Periodically looks up every entity the registered automations depend on
//! and reports the ones that look unresponsive.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use ha_config::HealthConfig;
use ha_core::State;
use ha_trace::{LogInfo, LogLevel, TraceStore};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::manager::AutomationManager;

/// Source of current entity states
#[async_trait]
pub trait EntityStateProvider: Send + Sync {
    async fn get_state(&self, entity_id: &str) -> anyhow::Result<Option<State>>;
}

/// Why an entity was reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityProblem {
    /// No state known for the entity
    Missing,
    /// State is unknown/unavailable
    BadState(String),
    /// Not updated within the staleness threshold
    Stale { seconds_since_update: i64 },
    /// The provider failed
    LookupFailed(String),
}

impl std::fmt::Display for EntityProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityProblem::Missing => write!(f, "no state"),
            EntityProblem::BadState(state) => write!(f, "bad state '{}'", state),
            EntityProblem::Stale {
                seconds_since_update,
            } => write!(f, "not updated for {}s", seconds_since_update),
            EntityProblem::LookupFailed(e) => write!(f, "lookup failed: {}", e),
        }
    }
}

/// One unresponsive entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub entity_id: String,
    pub problem: EntityProblem,
}

pub struct HealthPoller {
    manager: Arc<AutomationManager>,
    provider: Arc<dyn EntityStateProvider>,
    store: Arc<TraceStore>,
    config: HealthConfig,
}

impl HealthPoller {
    pub fn new(
        manager: Arc<AutomationManager>,
        provider: Arc<dyn EntityStateProvider>,
        config: HealthConfig,
    ) -> Self {
        let store = Arc::clone(manager.trace_store());
        Self {
            manager,
            provider,
            store,
            config,
        }
    }

    /// Check every tracked entity once
    pub async fn check_once(&self) -> Vec<HealthReport> {
        let stale_after = self.config.stale_after();
        let now = Utc::now();
        let mut reports = Vec::new();

        for entity_id in self.manager.get_entities_to_track() {
            let problem = match self.provider.get_state(&entity_id).await {
                Err(e) => Some(EntityProblem::LookupFailed(format!("{:#}", e))),
                Ok(None) => Some(EntityProblem::Missing),
                Ok(Some(state)) if state.is_bad() => Some(EntityProblem::BadState(
                    state.value().unwrap_or("null").to_string(),
                )),
                Ok(Some(state))
                    if (now - state.last_updated)
                        .to_std()
                        .is_ok_and(|age| age > stale_after) =>
                {
                    Some(EntityProblem::Stale {
                        seconds_since_update: (now - state.last_updated).num_seconds(),
                    })
                }
                Ok(Some(_)) => None,
            };

            if let Some(problem) = problem {
                warn!(entity_id = %entity_id, problem = %problem, "Entity looks unresponsive");
                self.store.append_tracker_log(
                    LogInfo::new(
                        LogLevel::Warning,
                        "ha_automation::health",
                        format!("{} is unresponsive: {}", entity_id, problem),
                    )
                    .with_property("entity_id", json!(entity_id)),
                );
                reports.push(HealthReport { entity_id, problem });
            }
        }

        debug!(problems = reports.len(), "Health check complete");
        reports
    }

    /// Poll until `shutdown` is cancelled
    ///
    /// Each cycle also purges expired trace records.
    pub async fn run(&self, shutdown: CancellationToken) {
        if !self.config.enabled {
            info!("Health poller disabled");
            return;
        }

        info!(
            interval_secs = self.config.poll_interval_secs,
            "Health poller started"
        );
        let mut interval = tokio::time::interval(self.config.poll_interval());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.check_once().await;
                    self.store.purge_expired();
                }
            }
        }

        info!("Health poller stopped");
    }
}
