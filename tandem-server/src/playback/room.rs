//! Room and track playback model
//!
//! `Room` owns the canonical timeline for one room. Fields are private so
//! every mutation goes through a method that keeps the invariant
//! `is_playing ⇒ started_at.is_some() && paused_at.is_none()`.

use tandem_common::api::PlaybackStateView;
use tandem_common::events::PlaybackStatus;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Immutable uploaded track
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub id: Uuid,
    /// Duration in seconds
    pub duration: f64,
    pub title: Option<String>,
}

impl Track {
    pub fn new(id: Uuid, duration: f64) -> Self {
        Self {
            id,
            duration: duration.max(0.0),
            title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// Canonical playback state of one room
#[derive(Debug, Clone)]
pub struct Room {
    id: Uuid,
    administrator_id: Uuid,
    current_track: Option<Track>,
    is_playing: bool,
    started_at: Option<f64>,
    paused_at: Option<f64>,
}

impl Room {
    /// New room with nothing loaded
    pub fn new(id: Uuid, administrator_id: Uuid) -> Self {
        Self {
            id,
            administrator_id,
            current_track: None,
            is_playing: false,
            started_at: None,
            paused_at: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn administrator_id(&self) -> Uuid {
        self.administrator_id
    }

    pub fn current_track(&self) -> Option<&Track> {
        self.current_track.as_ref()
    }

    pub fn current_track_id(&self) -> Option<Uuid> {
        self.current_track.as_ref().map(|t| t.id)
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    pub fn started_at(&self) -> Option<f64> {
        self.started_at
    }

    pub fn paused_at(&self) -> Option<f64> {
        self.paused_at
    }

    pub fn status(&self) -> PlaybackStatus {
        if self.is_playing {
            PlaybackStatus::Playing
        } else if self.paused_at.is_some() {
            PlaybackStatus::Paused
        } else {
            PlaybackStatus::Stopped
        }
    }

    /// Load `track` and start it from zero at `now`
    pub fn start(&mut self, track: Track, now: f64) {
        self.current_track = Some(track);
        self.is_playing = true;
        self.started_at = Some(now);
        self.paused_at = None;
        self.debug_check();
    }

    /// Freeze the timeline at `now`, returning the frozen position
    pub fn pause(&mut self, now: f64) -> Result<f64> {
        if !self.is_playing {
            return Err(Error::InvalidState(format!(
                "cannot pause room {} while {}",
                self.id,
                self.status()
            )));
        }
        let started_at = self.started_at.ok_or_else(|| {
            Error::Internal(format!("room {} playing without started_at", self.id))
        })?;

        self.is_playing = false;
        self.paused_at = Some(now);
        self.debug_check();
        Ok(self.clamp(now - started_at))
    }

    /// Continue from the frozen position
    ///
    /// `started_at` is shifted forward by the time spent paused so that
    /// `now - started_at` equals the position at the moment of pausing.
    pub fn resume(&mut self, now: f64) -> Result<()> {
        let (Some(started_at), Some(paused_at)) = (self.started_at, self.paused_at) else {
            return Err(Error::InvalidState(format!(
                "cannot resume room {} while {}",
                self.id,
                self.status()
            )));
        };
        if self.is_playing {
            return Err(Error::InvalidState(format!(
                "cannot resume room {} while playing",
                self.id
            )));
        }

        self.started_at = Some(now - (paused_at - started_at));
        self.paused_at = None;
        self.is_playing = true;
        self.debug_check();
        Ok(())
    }

    /// Unload the current track
    pub fn stop(&mut self) {
        self.current_track = None;
        self.is_playing = false;
        self.started_at = None;
        self.paused_at = None;
        self.debug_check();
    }

    /// Elapsed position at `now`, clamped to `[0, duration]`
    ///
    /// Playing: `now - started_at`. Paused: `paused_at - started_at`.
    /// Never started: 0.
    pub fn position_at(&self, now: f64) -> f64 {
        let raw = match (self.is_playing, self.started_at, self.paused_at) {
            (true, Some(started_at), _) => now - started_at,
            (false, Some(started_at), Some(paused_at)) => paused_at - started_at,
            _ => 0.0,
        };
        self.clamp(raw)
    }

    fn clamp(&self, position: f64) -> f64 {
        let duration = self.current_track.as_ref().map_or(0.0, |t| t.duration);
        if position.is_nan() {
            return 0.0;
        }
        position.max(0.0).min(duration.max(0.0))
    }

    /// Whether the playing/timestamp invariant holds
    pub fn invariant_holds(&self) -> bool {
        !self.is_playing
            || (self.started_at.is_some() && self.paused_at.is_none() && self.current_track.is_some())
    }

    fn debug_check(&self) {
        debug_assert!(self.invariant_holds(), "room invariant violated: {:?}", self);
    }

    /// Wire snapshot at `now`
    pub fn view(&self, now: f64) -> PlaybackStateView {
        PlaybackStateView {
            room_id: self.id,
            track_id: self.current_track_id(),
            is_playing: self.is_playing,
            started_at: self.started_at,
            paused_at: self.paused_at,
            position: self.position_at(now),
            duration: self.current_track.as_ref().map(|t| t.duration),
            server_time: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room_with_track(duration: f64) -> (Room, Track) {
        let room = Room::new(Uuid::new_v4(), Uuid::new_v4());
        let track = Track::new(Uuid::new_v4(), duration);
        (room, track)
    }

    #[test]
    fn test_new_room_is_stopped_at_zero() {
        let (room, _) = room_with_track(180.0);
        assert_eq!(room.status(), PlaybackStatus::Stopped);
        assert_eq!(room.position_at(1_000.0), 0.0);
        assert!(room.invariant_holds());
    }

    #[test]
    fn test_position_while_playing() {
        let (mut room, track) = room_with_track(180.0);
        room.start(track, 0.0);
        assert!((room.position_at(5.0) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_position_clamped_to_duration_and_zero() {
        let (mut room, track) = room_with_track(30.0);
        room.start(track, 100.0);
        assert_eq!(room.position_at(500.0), 30.0);
        // Clock behind started_at (never negative)
        assert_eq!(room.position_at(90.0), 0.0);
    }

    #[test]
    fn test_pause_freezes_position() {
        let (mut room, track) = room_with_track(180.0);
        room.start(track, 0.0);
        let frozen = room.pause(10.0).unwrap();
        assert!((frozen - 10.0).abs() < 1e-9);
        assert_eq!(room.status(), PlaybackStatus::Paused);
        assert!((room.position_at(25.0) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_pause_then_resume_preserves_elapsed() {
        let (mut room, track) = room_with_track(180.0);
        room.start(track, 0.0);
        room.pause(10.0).unwrap();
        room.resume(15.0).unwrap();
        assert_eq!(room.started_at(), Some(5.0));
        assert!((room.position_at(15.0) - 10.0).abs() < 1e-9);
        assert!((room.position_at(18.0) - 13.0).abs() < 1e-9);
    }

    #[test]
    fn test_pause_while_stopped_is_invalid() {
        let (mut room, _) = room_with_track(180.0);
        assert!(matches!(room.pause(1.0), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_resume_while_playing_or_stopped_is_invalid() {
        let (mut room, track) = room_with_track(180.0);
        assert!(matches!(room.resume(1.0), Err(Error::InvalidState(_))));
        room.start(track, 0.0);
        assert!(matches!(room.resume(1.0), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_stop_clears_everything() {
        let (mut room, track) = room_with_track(180.0);
        room.start(track, 0.0);
        room.stop();
        assert_eq!(room.status(), PlaybackStatus::Stopped);
        assert!(room.current_track_id().is_none());
        assert!(room.started_at().is_none());
        assert_eq!(room.position_at(50.0), 0.0);
    }

    #[test]
    fn test_view_reports_server_time_and_duration() {
        let (mut room, track) = room_with_track(180.0);
        let track_id = track.id;
        room.start(track, 1_000.0);
        let view = room.view(1_002.0);
        assert_eq!(view.track_id, Some(track_id));
        assert_eq!(view.started_at, Some(1_000.0));
        assert_eq!(view.server_time, 1_002.0);
        assert_eq!(view.duration, Some(180.0));
        assert!((view.position - 2.0).abs() < 1e-9);
    }
}
