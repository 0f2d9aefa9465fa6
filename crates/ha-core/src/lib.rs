//! Core types for the automation engine
//!
//! This crate provides the fundamental types shared by every other crate:
//! entity [`State`], the timed [`StateChange`] event delivered to automations,
//! and the [`EventTiming`] bitset describing how an event relates to process
//! startup and to the cached state of its entity.

mod event;
mod state;
mod timing;

pub use event::StateChange;
pub use state::State;
pub use timing::EventTiming;

/// State value reported when an entity's state cannot be determined
pub const STATE_UNKNOWN: &str = "unknown";

/// State value reported when an entity is not reachable
pub const STATE_UNAVAILABLE: &str = "unavailable";

/// State values (compared case-insensitively) that mark a state as "bad"
pub const BAD_STATES: [&str; 4] = [STATE_UNKNOWN, STATE_UNAVAILABLE, "none", "null"];
