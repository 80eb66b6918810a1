//! Event types for the Tandem room channel
//!
//! Provides the fixed event vocabulary, the wire envelope, and the
//! WebSocket frames exchanged between server and clients.

// Sub-modules (supporting types)
mod messages;
mod playback_types;

pub use messages::{ClientMessage, ServerMessage};
pub use playback_types::{EventPriority, PlaybackStatus};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

/// Room event vocabulary
///
/// One logical channel per room carries these events. The enum is
/// serialized adjacently tagged (`type` + `data`) so the envelope can carry
/// the payload as opaque JSON and clients can skip kinds they don't know.
///
/// Every playback-related payload includes `server_time` (epoch seconds)
/// and, where relevant, `started_at` / `paused_at` in the same unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RoomEvent {
    /// A listener connected to the room channel
    UserJoined {
        user_id: Uuid,
        #[serde(default)]
        is_administrator: bool,
    },

    /// A listener left or was cleaned up as stale
    UserLeft { user_id: Uuid },

    /// Track added to the room queue (external queue component)
    TrackAdded {
        track_id: Uuid,
        #[serde(default)]
        title: Option<String>,
        duration: f64,
    },

    /// Vote tally for a track changed
    TrackVoted {
        track_id: Uuid,
        user_id: Uuid,
        votes: i64,
    },

    /// Track removed from the queue
    TrackRemoved { track_id: Uuid },

    /// Administrator started a track
    PlaybackStarted {
        track_id: Uuid,
        duration: f64,
        started_at: f64,
        server_time: f64,
    },

    /// Administrator paused; `position` is the frozen elapsed time
    PlaybackPaused {
        track_id: Option<Uuid>,
        started_at: f64,
        paused_at: f64,
        position: f64,
        server_time: f64,
    },

    /// Administrator resumed; `started_at` is already shifted by the pause
    PlaybackResumed {
        track_id: Option<Uuid>,
        #[serde(default)]
        duration: Option<f64>,
        started_at: f64,
        server_time: f64,
    },

    /// Administrator skipped; `next_track` is None when the queue ran out
    TrackSkipped {
        previous_track: Option<Uuid>,
        next_track: Option<Uuid>,
        #[serde(default)]
        duration: Option<f64>,
        started_at: Option<f64>,
        server_time: f64,
    },

    /// Room metadata changed (administrator presence, listener count)
    RoomUpdated {
        administrator_connected: bool,
        listener_count: usize,
        server_time: f64,
    },
}

impl RoomEvent {
    /// Wire name of the event kind
    pub fn event_type(&self) -> &'static str {
        match self {
            RoomEvent::UserJoined { .. } => "UserJoined",
            RoomEvent::UserLeft { .. } => "UserLeft",
            RoomEvent::TrackAdded { .. } => "TrackAdded",
            RoomEvent::TrackVoted { .. } => "TrackVoted",
            RoomEvent::TrackRemoved { .. } => "TrackRemoved",
            RoomEvent::PlaybackStarted { .. } => "PlaybackStarted",
            RoomEvent::PlaybackPaused { .. } => "PlaybackPaused",
            RoomEvent::PlaybackResumed { .. } => "PlaybackResumed",
            RoomEvent::TrackSkipped { .. } => "TrackSkipped",
            RoomEvent::RoomUpdated { .. } => "RoomUpdated",
        }
    }

    /// Priority the broadcaster uses when the caller doesn't override it
    ///
    /// Playback and membership changes are critical; queue edits are high;
    /// votes are normal; room metadata is low.
    pub fn default_priority(&self) -> EventPriority {
        match self {
            RoomEvent::PlaybackStarted { .. }
            | RoomEvent::PlaybackPaused { .. }
            | RoomEvent::PlaybackResumed { .. }
            | RoomEvent::TrackSkipped { .. }
            | RoomEvent::UserJoined { .. }
            | RoomEvent::UserLeft { .. } => EventPriority::Critical,
            RoomEvent::TrackAdded { .. } | RoomEvent::TrackRemoved { .. } => EventPriority::High,
            RoomEvent::TrackVoted { .. } => EventPriority::Normal,
            RoomEvent::RoomUpdated { .. } => EventPriority::Low,
        }
    }
}

/// Immutable envelope of a published event
///
/// `event_type` + `data` hold the serialized `RoomEvent`. Keeping the
/// payload as raw JSON lets a client built against an older vocabulary
/// decode the envelope and ignore the kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique id, used for confirmation and de-duplication
    pub event_id: Uuid,
    /// Event kind name
    #[serde(rename = "type")]
    pub event_type: String,
    /// Target room (None for global broadcasts)
    pub room_id: Option<Uuid>,
    /// Typed payload serialized as JSON
    #[serde(default)]
    pub data: serde_json::Value,
    /// Bookkeeping priority
    pub priority: EventPriority,
    /// Server time when the event was published (epoch seconds)
    pub server_time: f64,
}

impl EventEnvelope {
    /// Wrap an event, assigning a fresh event id
    pub fn new(
        room_id: Option<Uuid>,
        event: &RoomEvent,
        priority: EventPriority,
        server_time: f64,
    ) -> crate::Result<Self> {
        let mut value = serde_json::to_value(event)?;
        let data = value
            .get_mut("data")
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Null);

        Ok(Self {
            event_id: Uuid::new_v4(),
            event_type: event.event_type().to_string(),
            room_id,
            data,
            priority,
            server_time,
        })
    }

    /// Decode the typed event
    ///
    /// Returns None for kinds outside the vocabulary (treated as no-ops) and
    /// for known kinds whose payload fails to decode (logged).
    pub fn decode(&self) -> Option<RoomEvent> {
        let tagged = serde_json::json!({ "type": self.event_type, "data": self.data });
        match serde_json::from_value::<RoomEvent>(tagged) {
            Ok(event) => Some(event),
            Err(e) if is_known_event_type(&self.event_type) => {
                warn!("Malformed {} payload ({}): {}", self.event_type, self.event_id, e);
                None
            }
            Err(_) => {
                debug!("Ignoring unknown event type: {}", self.event_type);
                None
            }
        }
    }
}

/// All event kind names in the room vocabulary
pub const EVENT_TYPES: [&str; 10] = [
    "UserJoined",
    "UserLeft",
    "TrackAdded",
    "TrackVoted",
    "TrackRemoved",
    "PlaybackStarted",
    "PlaybackPaused",
    "PlaybackResumed",
    "TrackSkipped",
    "RoomUpdated",
];

/// Whether `name` belongs to the fixed event vocabulary
pub fn is_known_event_type(name: &str) -> bool {
    EVENT_TYPES.contains(&name)
}
