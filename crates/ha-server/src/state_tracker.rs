//! Entity state cache and timing classifier
//!
//! Incoming states are classified against process startup and the last state
//! cached for the entity, then published on the event bus.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ha_automation::EntityStateProvider;
use ha_core::{EventTiming, State, StateChange};
use ha_event_bus::EventBus;
use tracing::debug;

pub struct StateTracker {
    bus: Arc<EventBus>,
    cache: DashMap<String, State>,
    startup: DateTime<Utc>,
}

impl StateTracker {
    /// Tracker whose startup instant is now
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self::with_startup(bus, Utc::now())
    }

    pub fn with_startup(bus: Arc<EventBus>, startup: DateTime<Utc>) -> Self {
        Self {
            bus,
            cache: DashMap::new(),
            startup,
        }
    }

    pub fn startup(&self) -> DateTime<Utc> {
        self.startup
    }

    /// Prime the cache without publishing, e.g. with states saved by a
    /// previous run
    pub fn seed(&self, state: State) {
        self.cache.insert(state.entity_id.clone(), state);
    }

    /// Classify a state, update the cache, and publish the change
    ///
    /// The cache only moves forward: a state older than the cached one is
    /// published but does not replace it.
    pub fn ingest(&self, state: State) -> StateChange {
        // Classify and update under the entry guard so concurrent ingests of
        // one entity observe each other
        let (cached, timing) = match self.cache.entry(state.entity_id.clone()) {
            Entry::Occupied(mut entry) => {
                let cached = entry.get().clone();
                let timing = EventTiming::classify(&state, self.startup, Some(&cached));
                if state.last_updated >= cached.last_updated {
                    entry.insert(state.clone());
                }
                (Some(cached), timing)
            }
            Entry::Vacant(entry) => {
                let timing = EventTiming::classify(&state, self.startup, None);
                entry.insert(state.clone());
                (None, timing)
            }
        };

        debug!(entity_id = %state.entity_id, timing = %timing, "Classified state change");
        let change = StateChange::new(state, cached).with_timing(timing);
        self.bus.fire(change.clone());
        change
    }

    /// Last cached state of an entity
    pub fn get(&self, entity_id: &str) -> Option<State> {
        self.cache.get(entity_id).map(|s| s.value().clone())
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[async_trait]
impl EntityStateProvider for StateTracker {
    async fn get_state(&self, entity_id: &str) -> anyhow::Result<Option<State>> {
        Ok(self.get(entity_id))
    }
}
