//! Automation metadata

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity, enablement and bookkeeping for one registered automation
///
/// Automations may supply their own metadata; anything they leave out is
/// filled in by the engine at registration. The timestamps are written only
/// by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationMetadata {
    /// Human-readable name
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Whether matching events are dispatched to the automation
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Preferred key; the name is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_request: Option<String>,

    /// Unique key assigned at registration
    #[serde(default)]
    pub given_key: String,

    /// Also dispatch events whose new state is unknown/unavailable
    #[serde(default)]
    pub trigger_on_bad_state: bool,

    /// Entities reported to the health poller besides the triggers
    #[serde(default)]
    pub additional_entities_to_track: BTreeSet<String>,

    #[serde(default)]
    pub is_delayable: bool,

    /// Name of the registry the automation was registered from
    #[serde(default)]
    pub source: String,

    /// Implementing type
    #[serde(default)]
    pub automation_type: String,

    /// Set when the automation's metadata accessor failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_metadata_error: Option<String>,

    /// Set when the automation's trigger accessor failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_trigger_error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_triggered: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_executed: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_scheduled: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

impl AutomationMetadata {
    /// Enabled metadata with only a name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            enabled: true,
            key_request: None,
            given_key: String::new(),
            trigger_on_bad_state: false,
            additional_entities_to_track: BTreeSet::new(),
            is_delayable: false,
            source: String::new(),
            automation_type: String::new(),
            user_metadata_error: None,
            user_trigger_error: None,
            last_triggered: None,
            last_executed: None,
            next_scheduled: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key_request = Some(key.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_trigger_on_bad_state(mut self, trigger_on_bad_state: bool) -> Self {
        self.trigger_on_bad_state = trigger_on_bad_state;
        self
    }

    /// Track an extra entity in the health poller
    pub fn tracking(mut self, entity_id: impl Into<String>) -> Self {
        self.additional_entities_to_track.insert(entity_id.into());
        self
    }

    /// The string the unique key is derived from
    pub fn key_source(&self) -> &str {
        self.key_request.as_deref().unwrap_or(&self.name)
    }
}

/// Normalize a requested key
///
/// Lowercases, replaces every run of characters outside `[a-z0-9-]` with a
/// single `_`, and trims leading and trailing `_`.
pub fn clean_key(raw: &str) -> String {
    let mut key = String::with_capacity(raw.len());
    let mut pending_separator = false;

    for c in raw.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
            if pending_separator && !key.is_empty() {
                key.push('_');
            }
            pending_separator = false;
            key.push(c);
        } else {
            pending_separator = true;
        }
    }

    key
}
