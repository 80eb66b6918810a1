//! Wire types for the HTTP endpoints

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header carrying the caller's user id on control requests
///
/// Identity is established by the external login layer; the room server
/// only compares it against the room's administrator.
pub const USER_ID_HEADER: &str = "x-user-id";

/// GET /api/v1/time response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerTimeResponse {
    /// ISO-8601 server time
    pub timestamp: String,
    /// Server time as epoch seconds
    pub unix_timestamp: f64,
}

/// POST /api/v1/rooms/:room_id/playback/start body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartPlaybackRequest {
    pub track_id: Uuid,
}

/// Snapshot of a room's playback state as seen on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackStateView {
    pub room_id: Uuid,
    #[serde(default)]
    pub track_id: Option<Uuid>,
    pub is_playing: bool,
    #[serde(default)]
    pub started_at: Option<f64>,
    #[serde(default)]
    pub paused_at: Option<f64>,
    /// Clamped elapsed position at `server_time` (seconds)
    #[serde(default)]
    pub position: f64,
    /// Duration of the current track (seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    /// Authoritative "now" for offset purposes
    pub server_time: f64,
}

/// Response body of every playback control endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackStateResponse {
    pub playback_state: PlaybackStateView,
}

/// Error body returned by the server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable error kind (e.g. "authorization_error")
    pub error: String,
    /// Human-readable message
    pub message: String,
}

/// GET /health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub module: String,
    pub version: String,
    pub rooms: usize,
    pub connections: usize,
}
