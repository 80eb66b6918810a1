//! Position calculator
//!
//! Keeps the client's last known copy of the room timeline, updated from the
//! welcome snapshot and playback events, and projects it to "now" using the
//! clock offset.

use tandem_common::api::PlaybackStateView;
use tandem_common::events::{PlaybackStatus, RoomEvent};
use uuid::Uuid;

/// Last known room playback state (server timestamps, epoch seconds)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomSnapshot {
    pub track_id: Option<Uuid>,
    pub duration: Option<f64>,
    pub is_playing: bool,
    pub started_at: Option<f64>,
    pub paused_at: Option<f64>,
    /// Position frozen by the last pause (seconds)
    pub position: f64,
    /// Server time of the last update
    pub server_time: f64,
}

impl RoomSnapshot {
    pub fn from_view(view: &PlaybackStateView) -> Self {
        Self {
            track_id: view.track_id,
            duration: view.duration,
            is_playing: view.is_playing,
            started_at: view.started_at,
            paused_at: view.paused_at,
            position: view.position,
            server_time: view.server_time,
        }
    }

    pub fn status(&self) -> PlaybackStatus {
        if self.is_playing {
            PlaybackStatus::Playing
        } else if self.track_id.is_some() && self.paused_at.is_some() {
            PlaybackStatus::Paused
        } else {
            PlaybackStatus::Stopped
        }
    }

    /// Fold a room event into the snapshot
    ///
    /// Returns true if the timeline changed. Non-playback events leave the
    /// snapshot untouched.
    pub fn apply(&mut self, event: &RoomEvent) -> bool {
        match event {
            RoomEvent::PlaybackStarted {
                track_id,
                duration,
                started_at,
                server_time,
            } => {
                self.track_id = Some(*track_id);
                self.duration = Some(*duration);
                self.is_playing = true;
                self.started_at = Some(*started_at);
                self.paused_at = None;
                self.position = 0.0;
                self.server_time = *server_time;
                true
            }
            RoomEvent::PlaybackPaused {
                track_id,
                started_at,
                paused_at,
                position,
                server_time,
            } => {
                if track_id.is_some() {
                    self.track_id = *track_id;
                }
                self.is_playing = false;
                self.started_at = Some(*started_at);
                self.paused_at = Some(*paused_at);
                self.position = *position;
                self.server_time = *server_time;
                true
            }
            RoomEvent::PlaybackResumed {
                track_id,
                duration,
                started_at,
                server_time,
            } => {
                if track_id.is_some() {
                    self.track_id = *track_id;
                }
                if duration.is_some() {
                    self.duration = *duration;
                }
                self.is_playing = true;
                self.started_at = Some(*started_at);
                self.paused_at = None;
                self.server_time = *server_time;
                true
            }
            RoomEvent::TrackSkipped {
                next_track,
                duration,
                started_at,
                server_time,
                ..
            } => {
                match (next_track, started_at) {
                    (Some(next), Some(started_at)) => {
                        self.track_id = Some(*next);
                        self.duration = *duration;
                        self.is_playing = true;
                        self.started_at = Some(*started_at);
                    }
                    _ => {
                        self.track_id = None;
                        self.duration = None;
                        self.is_playing = false;
                        self.started_at = None;
                    }
                }
                self.paused_at = None;
                self.position = 0.0;
                self.server_time = *server_time;
                true
            }
            RoomEvent::UserJoined { .. }
            | RoomEvent::UserLeft { .. }
            | RoomEvent::TrackAdded { .. }
            | RoomEvent::TrackVoted { .. }
            | RoomEvent::TrackRemoved { .. }
            | RoomEvent::RoomUpdated { .. } => false,
        }
    }

    /// Expected position (seconds) at local time `local_now_ms`
    ///
    /// Paused or stopped: the stored position. Playing:
    /// `clamp((now + offset) - started_at, 0, duration)`.
    pub fn expected_position(&self, local_now_ms: f64, offset_ms: f64) -> f64 {
        let raw = match (self.is_playing, self.started_at) {
            (true, Some(started_at)) => (local_now_ms + offset_ms) / 1000.0 - started_at,
            _ => return self.position,
        };
        if raw.is_nan() {
            return 0.0;
        }
        let upper = self.duration.unwrap_or(f64::INFINITY).max(0.0);
        raw.max(0.0).min(upper)
    }
}
