//! Automation engine loop
//!
//! This module provides the `AutomationEngine`, which listens to the event bus
//! and hands every state change to the automation manager for dispatch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ha_automation::AutomationManager;
use ha_event_bus::EventBus;
use tokio::sync::broadcast;
use tracing::{info, trace, warn};

/// Connects the event bus to the automation manager
pub struct AutomationEngine {
    /// Event bus for subscribing to state changes
    event_bus: Arc<EventBus>,
    /// Automation manager with all registered automations
    manager: Arc<AutomationManager>,
    /// Running flag
    running: Arc<AtomicBool>,
    /// Shutdown signal sender
    shutdown_tx: broadcast::Sender<()>,
}

impl AutomationEngine {
    pub fn new(event_bus: Arc<EventBus>, manager: Arc<AutomationManager>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            event_bus,
            manager,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    pub fn manager(&self) -> Arc<AutomationManager> {
        self.manager.clone()
    }

    /// Start the engine
    ///
    /// Every received state change is dispatched on its own task, so a slow
    /// automation never holds up the bus.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Automation engine already running");
            return;
        }

        info!(automations = self.manager.count(), "Starting automation engine");

        let mut event_rx = self.event_bus.subscribe_all();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let manager = self.manager.clone();
        let running = self.running.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event_result = event_rx.recv() => {
                        match event_result {
                            Ok(change) => {
                                trace!(entity_id = %change.entity_id, "Processing state change");
                                let manager = manager.clone();
                                tokio::spawn(async move {
                                    manager.trigger_automations(&change).await;
                                });
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!("Automation engine lagged by {} events", n);
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                info!("Event bus closed, stopping automation engine");
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Received shutdown signal");
                        break;
                    }
                }
            }

            running.store(false, Ordering::SeqCst);
            info!("Automation engine stopped");
        });
    }

    /// Stop the engine
    pub fn stop(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        info!("Stopping automation engine");
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
