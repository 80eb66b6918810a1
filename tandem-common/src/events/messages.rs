//! WebSocket frames exchanged on the room channel

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::EventEnvelope;
use crate::api::PlaybackStateView;

/// Frames sent from a client to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Receipt for a critical event
    Confirm { event_id: Uuid },

    /// Latency probe, echoed back as `Pong`
    Ping { client_time: f64 },

    /// Vote for a queued track (forwarded to the external queue component)
    Vote { track_id: Uuid, value: i32 },
}

/// Frames sent from the server to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First frame after the upgrade: connection id and current room state
    Welcome {
        connection_id: Uuid,
        playback_state: PlaybackStateView,
    },

    /// A published room event
    Event(EventEnvelope),

    /// Reply to `Ping`
    Pong { client_time: f64, server_time: f64 },

    /// Request-scoped error (the connection stays open)
    Error { message: String },
}
