//! Event timing classification
//!
//! Every event is tagged with exactly one primary [`EventTiming`] value.
//! Automations declare the set of timings they accept as a mask built from the
//! same constants; an event matches when every bit of its tag is in the mask.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::State;

/// Bitset describing an event's relation to startup and to the cached state
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventTiming(u8);

impl EventTiming {
    /// Empty mask. Never produced by classification.
    pub const NONE: Self = Self(0);
    /// Event predates startup and nothing is cached for the entity
    pub const PRE_STARTUP_NOT_CACHED: Self = Self(1);
    /// Event predates startup and is older than the cached state
    pub const PRE_STARTUP_PRE_LAST_CACHED: Self = Self(1 << 1);
    /// Event predates startup and is the cached state itself
    pub const PRE_STARTUP_SAME_AS_LAST_CACHED: Self = Self(1 << 2);
    /// Event predates startup and shares the cached instant with a different value
    pub const PRE_STARTUP_SAME_INSTANT_AS_CACHED: Self = Self(1 << 3);
    /// Event predates startup and is newer than the cached state
    pub const PRE_STARTUP_POST_LAST_CACHED: Self = Self(1 << 4);
    /// Event happened after startup
    pub const POST_STARTUP: Self = Self(1 << 5);
    /// Union of every primary value
    pub const ALL: Self = Self(0b11_1111);

    const NAMES: [(Self, &'static str); 6] = [
        (Self::PRE_STARTUP_NOT_CACHED, "PreStartupNotCached"),
        (Self::PRE_STARTUP_PRE_LAST_CACHED, "PreStartupPreLastCached"),
        (Self::PRE_STARTUP_SAME_AS_LAST_CACHED, "PreStartupSameAsLastCached"),
        (
            Self::PRE_STARTUP_SAME_INSTANT_AS_CACHED,
            "PreStartupSameInstantAsCached",
        ),
        (Self::PRE_STARTUP_POST_LAST_CACHED, "PreStartupPostLastCached"),
        (Self::POST_STARTUP, "PostStartup"),
    ];

    /// Raw bits
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Build from raw bits, dropping anything outside [`EventTiming::ALL`]
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & Self::ALL.0)
    }

    /// Whether every bit of `other` is set in `self`
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether an automation declaring this mask wants an event tagged `event`
    pub const fn accepts(self, event: Self) -> bool {
        self.contains(event)
    }

    /// Classify an incoming state against process startup and the cached state
    ///
    /// `cached` is the last state the engine knew for the entity before this
    /// event arrived.
    pub fn classify(state: &State, startup: DateTime<Utc>, cached: Option<&State>) -> Self {
        if state.last_updated >= startup {
            return Self::POST_STARTUP;
        }

        let Some(cached) = cached else {
            return Self::PRE_STARTUP_NOT_CACHED;
        };

        match state.last_updated.cmp(&cached.last_updated) {
            std::cmp::Ordering::Less => Self::PRE_STARTUP_PRE_LAST_CACHED,
            std::cmp::Ordering::Greater => Self::PRE_STARTUP_POST_LAST_CACHED,
            std::cmp::Ordering::Equal if state.state == cached.state => {
                Self::PRE_STARTUP_SAME_AS_LAST_CACHED
            }
            std::cmp::Ordering::Equal => Self::PRE_STARTUP_SAME_INSTANT_AS_CACHED,
        }
    }
}

impl Default for EventTiming {
    fn default() -> Self {
        Self::POST_STARTUP
    }
}

impl BitOr for EventTiming {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventTiming {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for EventTiming {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for EventTiming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventTiming({})", self)
    }
}

impl fmt::Display for EventTiming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::ALL {
            return write!(f, "All");
        }
        if *self == Self::NONE {
            return write!(f, "None");
        }

        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, " | ")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}
