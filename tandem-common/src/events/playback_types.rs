//! Playback-related type definitions
//!
//! Supporting types for room playback state and event priority.

use serde::{Deserialize, Serialize};

/// Playback status of a room
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackStatus {
    /// No track loaded or playback stopped after the queue ran out
    Stopped,
    /// Track playing on the authoritative timeline
    Playing,
    /// Timeline frozen at `paused_at`
    Paused,
}

impl std::fmt::Display for PlaybackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackStatus::Stopped => write!(f, "stopped"),
            PlaybackStatus::Playing => write!(f, "playing"),
            PlaybackStatus::Paused => write!(f, "paused"),
        }
    }
}

/// Delivery priority of a broadcast event
///
/// Priority only changes bookkeeping: `Critical` events are tracked until
/// every subscriber confirms or the confirmation timer fires. Ordering is
/// never affected.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl EventPriority {
    /// Whether delivery of events with this priority is confirmation-tracked
    pub fn requires_confirmation(self) -> bool {
        matches!(self, EventPriority::Critical)
    }
}

impl std::fmt::Display for EventPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventPriority::Critical => write!(f, "critical"),
            EventPriority::High => write!(f, "high"),
            EventPriority::Normal => write!(f, "normal"),
            EventPriority::Low => write!(f, "low"),
        }
    }
}
