//! The timed state-change event delivered to automations

use serde::{Deserialize, Serialize};

use crate::{EventTiming, State};

/// A state change for one entity, already classified by [`EventTiming`]
///
/// This is the only event shape the engine consumes. The transport layer
/// produces it from raw platform messages; the engine treats `timing` as an
/// opaque tag that it ANDs against each automation's declared mask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
    /// Entity that changed
    pub entity_id: String,

    /// The state after the change
    pub new_state: State,

    /// The state before the change, if it was known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_state: Option<State>,

    /// Relation of this event to startup and to the cached value
    pub timing: EventTiming,
}

impl StateChange {
    /// Create a post-startup state change
    pub fn new(new_state: State, old_state: Option<State>) -> Self {
        Self {
            entity_id: new_state.entity_id.clone(),
            new_state,
            old_state,
            timing: EventTiming::POST_STARTUP,
        }
    }

    /// Override the timing classification
    pub fn with_timing(mut self, timing: EventTiming) -> Self {
        self.timing = timing;
        self
    }
}
