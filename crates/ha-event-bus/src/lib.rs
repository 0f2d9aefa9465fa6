//! Event bus for timed state changes
//!
//! This crate provides the EventBus that carries classified [`StateChange`]
//! events from the transport side of the process to the automation engine.
//! Consumers can subscribe to every event or to a single entity.

use dashmap::DashMap;
use ha_core::StateChange;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Default channel capacity for event subscriptions
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// The event bus for publishing and subscribing to state changes
pub struct EventBus {
    /// Per-entity broadcast senders
    listeners: DashMap<String, broadcast::Sender<StateChange>>,
    /// Sender for subscribers interested in every entity
    match_all_sender: broadcast::Sender<StateChange>,
    /// Channel capacity
    capacity: usize,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with specified channel capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (match_all_sender, _) = broadcast::channel(capacity);
        Self {
            listeners: DashMap::new(),
            match_all_sender,
            capacity,
        }
    }

    /// Subscribe to state changes of a single entity
    pub fn subscribe(&self, entity_id: impl Into<String>) -> broadcast::Receiver<StateChange> {
        let entity_id = entity_id.into();
        trace!(entity_id = %entity_id, "Subscribing to entity");

        self.listeners
            .entry(entity_id)
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(self.capacity);
                tx
            })
            .subscribe()
    }

    /// Subscribe to all state changes
    pub fn subscribe_all(&self) -> broadcast::Receiver<StateChange> {
        self.match_all_sender.subscribe()
    }

    /// Publish a state change to the entity's subscribers and to every
    /// match-all subscriber
    pub fn fire(&self, event: StateChange) {
        debug!(entity_id = %event.entity_id, timing = %event.timing, "Firing state change");

        if let Some(sender) = self.listeners.get(&event.entity_id) {
            // No receivers left
            let _ = sender.send(event.clone());
        }

        let _ = self.match_all_sender.send(event);
    }

    /// Number of entities with a per-entity channel
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
