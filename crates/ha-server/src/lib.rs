//! Automation host
//!
//! Wires the event bus, state tracker, automation manager, trace store and
//! health poller into one running process.

pub mod automation_engine;
pub mod state_tracker;

use std::sync::Arc;

use anyhow::Result;
use ha_automation::{AutomationManager, AutomationRegistry, ExecutionContext, HealthPoller};
use ha_config::{EngineConfig, LoggingConfig};
use ha_event_bus::EventBus;
use ha_trace::{TraceLayer, TraceStore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub use automation_engine::AutomationEngine;
pub use state_tracker::StateTracker;

/// Install the global subscriber: console output filtered by `RUST_LOG` (or
/// the configured filter) plus trace capture into `store`
pub fn init_logging(config: &LoggingConfig, store: Arc<TraceStore>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.filter))?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_filter(filter),
        )
        .with(TraceLayer::new(store).with_filter(LevelFilter::DEBUG))
        .try_init()?;

    Ok(())
}

/// A running automation host
pub struct AutomationHost {
    /// Event bus carrying classified state changes
    pub bus: Arc<EventBus>,
    /// Entity state cache; feed incoming states through [`StateTracker::ingest`]
    pub states: Arc<StateTracker>,
    pub manager: Arc<AutomationManager>,
    pub store: Arc<TraceStore>,
    engine: AutomationEngine,
    shutdown: CancellationToken,
    poller: Option<JoinHandle<()>>,
}

impl AutomationHost {
    /// Build every component and start dispatching
    ///
    /// Registration failures are fatal. Logging is not installed here; see
    /// [`init_logging`].
    pub async fn start(
        config: &EngineConfig,
        store: Arc<TraceStore>,
        registries: &[Arc<dyn AutomationRegistry>],
    ) -> Result<Self> {
        let context = Arc::new(ExecutionContext::with_store(Arc::clone(&store)));
        let manager = Arc::new(AutomationManager::new(registries, context)?);

        let bus = Arc::new(EventBus::new());
        let states = Arc::new(StateTracker::new(bus.clone()));

        let engine = AutomationEngine::new(bus.clone(), manager.clone());
        engine.start();

        let shutdown = CancellationToken::new();
        let poller = if config.health.enabled {
            let poller = HealthPoller::new(manager.clone(), states.clone(), config.health.clone());
            let token = shutdown.clone();
            Some(tokio::spawn(async move { poller.run(token).await }))
        } else {
            None
        };

        info!(
            automations = manager.count(),
            tracked_entities = manager.get_entities_to_track().len(),
            "Automation host started"
        );

        Ok(Self {
            bus,
            states,
            manager,
            store,
            engine,
            shutdown,
            poller,
        })
    }

    pub fn is_running(&self) -> bool {
        self.engine.is_running()
    }

    /// Stop dispatching and wait for the health poller to exit
    pub async fn shutdown(mut self) -> Result<()> {
        info!("Shutting down automation host");
        self.engine.stop();
        self.shutdown.cancel();
        if let Some(poller) = self.poller.take() {
            poller.await?;
        }
        Ok(())
    }
}

/// Run until ctrl-c
pub async fn run(config: EngineConfig, registries: Vec<Arc<dyn AutomationRegistry>>) -> Result<()> {
    let store = Arc::new(TraceStore::new(&config.trace)?);
    init_logging(&config.logging, Arc::clone(&store))?;

    let host = AutomationHost::start(&config, store, &registries).await?;

    tokio::signal::ctrl_c().await?;
    host.shutdown().await
}
