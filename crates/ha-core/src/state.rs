//! State type representing an entity's current state

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::BAD_STATES;

/// Represents the state of an entity at a point in time
///
/// The state value is nullable: the platform may report an entity without any
/// value, which is treated the same as `unknown` or `unavailable`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    /// The entity this state belongs to (e.g. "switch.porch")
    pub entity_id: String,

    /// The state value (e.g., "on", "off", "23.5", "unavailable")
    pub state: Option<String>,

    /// Additional attributes associated with the state
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,

    /// When the state value last changed
    pub last_changed: DateTime<Utc>,

    /// When the state was last written, even if the value didn't change
    pub last_updated: DateTime<Utc>,
}

impl State {
    /// Create a new state with the current timestamp
    pub fn new(entity_id: impl Into<String>, state: impl Into<String>) -> Self {
        Self::with_value(entity_id, Some(state.into()))
    }

    /// Create a state that carries no value at all
    pub fn null(entity_id: impl Into<String>) -> Self {
        Self::with_value(entity_id, None)
    }

    fn with_value(entity_id: impl Into<String>, state: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            entity_id: entity_id.into(),
            state,
            attributes: HashMap::new(),
            last_changed: now,
            last_updated: now,
        }
    }

    /// Set the last updated/changed timestamps
    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.last_changed = time;
        self.last_updated = time;
        self
    }

    /// Add an attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// The state value, if any
    pub fn value(&self) -> Option<&str> {
        self.state.as_deref()
    }

    /// Check whether the state value equals `expected`
    pub fn is(&self, expected: &str) -> bool {
        self.value() == Some(expected)
    }

    /// Check if the state is null, unknown, unavailable or "none"/"null"
    pub fn is_bad(&self) -> bool {
        match self.value() {
            None => true,
            Some(value) => BAD_STATES
                .iter()
                .any(|bad| value.eq_ignore_ascii_case(bad)),
        }
    }

    /// Get an attribute value by key
    pub fn attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        // Timestamps are not compared
        self.entity_id == other.entity_id
            && self.state == other.state
            && self.attributes == other.attributes
    }
}
