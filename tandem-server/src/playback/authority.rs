//! Playback State Authority
//!
//! Owns the canonical `Room` state of every active room and is the only
//! writer of it. Each room sits behind its own async mutex: transitions for
//! one room never interleave, and the resulting event is published before
//! the lock is released so subscribers observe events in mutation order.
//!
//! All four control operations pass through [`PlaybackAuthority::authorize`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tandem_common::api::PlaybackStateView;
use tandem_common::events::RoomEvent;
use tandem_common::Clock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::directory::{RoomDirectory, TrackQueue};
use super::room::Room;
use crate::broadcast::EventBroadcaster;
use crate::error::{Error, Result};

/// Playback control service
pub struct PlaybackAuthority {
    rooms: RwLock<HashMap<Uuid, Arc<Mutex<Room>>>>,
    directory: Arc<dyn RoomDirectory>,
    queue: Arc<dyn TrackQueue>,
    broadcaster: EventBroadcaster,
    clock: Arc<dyn Clock>,
}

impl PlaybackAuthority {
    pub fn new(
        directory: Arc<dyn RoomDirectory>,
        queue: Arc<dyn TrackQueue>,
        broadcaster: EventBroadcaster,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            directory,
            queue,
            broadcaster,
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Number of rooms with loaded playback state
    pub fn active_rooms(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    // ========================================================================
    // Authorization
    // ========================================================================

    /// Single gate for every control operation
    pub fn authorize(&self, room: &Room, caller: Uuid, action: &str) -> Result<()> {
        if room.administrator_id() == caller {
            return Ok(());
        }
        warn!(
            "User {} attempted to {} in room {} (not administrator)",
            caller,
            action,
            room.id()
        );
        Err(Error::Authorization {
            action: action.to_string(),
        })
    }

    /// Whether `user_id` administers `room_id`
    pub fn is_administrator(&self, room_id: Uuid, user_id: Uuid) -> bool {
        self.directory.administrator_of(room_id) == Some(user_id)
    }

    // ========================================================================
    // Control operations
    // ========================================================================

    /// Load `track_id` and play it from zero
    pub async fn start(
        &self,
        room_id: Uuid,
        caller: Uuid,
        track_id: Uuid,
    ) -> Result<PlaybackStateView> {
        let handle = self.room_handle(room_id)?;
        let mut room = handle.lock().await;
        self.authorize(&room, caller, "start playback")?;

        let track = self
            .directory
            .track(track_id)
            .ok_or(Error::TrackNotFound(track_id))?;
        let now = self.clock.now_secs();
        let duration = track.duration;
        room.start(track, now);

        info!("Room {}: started track {} at {:.3}", room_id, track_id, now);
        self.publish(
            room_id,
            RoomEvent::PlaybackStarted {
                track_id,
                duration,
                started_at: now,
                server_time: now,
            },
        );
        Ok(room.view(now))
    }

    /// Freeze the timeline at the current position
    pub async fn pause(&self, room_id: Uuid, caller: Uuid) -> Result<PlaybackStateView> {
        let handle = self.room_handle(room_id)?;
        let mut room = handle.lock().await;
        self.authorize(&room, caller, "pause playback")?;

        let now = self.clock.now_secs();
        let position = room.pause(now)?;
        let started_at = room
            .started_at()
            .ok_or_else(|| Error::Internal(format!("room {} paused without started_at", room_id)))?;

        info!("Room {}: paused at position {:.3}s", room_id, position);
        self.publish(
            room_id,
            RoomEvent::PlaybackPaused {
                track_id: room.current_track_id(),
                started_at,
                paused_at: now,
                position,
                server_time: now,
            },
        );
        Ok(room.view(now))
    }

    /// Continue from the paused position
    pub async fn resume(&self, room_id: Uuid, caller: Uuid) -> Result<PlaybackStateView> {
        let handle = self.room_handle(room_id)?;
        let mut room = handle.lock().await;
        self.authorize(&room, caller, "resume playback")?;

        let now = self.clock.now_secs();
        room.resume(now)?;
        let started_at = room
            .started_at()
            .ok_or_else(|| Error::Internal(format!("room {} resumed without started_at", room_id)))?;

        info!(
            "Room {}: resumed at position {:.3}s",
            room_id,
            room.position_at(now)
        );
        self.publish(
            room_id,
            RoomEvent::PlaybackResumed {
                track_id: room.current_track_id(),
                duration: room.current_track().map(|t| t.duration),
                started_at,
                server_time: now,
            },
        );
        Ok(room.view(now))
    }

    /// Advance to the next track in vote order, or stop if there is none
    ///
    /// From stopped, the head of the queue starts.
    pub async fn skip(&self, room_id: Uuid, caller: Uuid) -> Result<PlaybackStateView> {
        let handle = self.room_handle(room_id)?;
        let mut room = handle.lock().await;
        self.authorize(&room, caller, "skip tracks")?;

        let previous = room.current_track_id();
        let next = self.queue.next_after(room_id, previous);
        let now = self.clock.now_secs();

        let event = match next {
            Some(track) => {
                let next_id = track.id;
                let duration = track.duration;
                room.start(track, now);
                info!("Room {}: skipped {:?} -> {}", room_id, previous, next_id);
                RoomEvent::TrackSkipped {
                    previous_track: previous,
                    next_track: Some(next_id),
                    duration: Some(duration),
                    started_at: Some(now),
                    server_time: now,
                }
            }
            None => {
                room.stop();
                info!("Room {}: skipped {:?}, queue empty, stopped", room_id, previous);
                RoomEvent::TrackSkipped {
                    previous_track: previous,
                    next_track: None,
                    duration: None,
                    started_at: None,
                    server_time: now,
                }
            }
        };

        self.publish(room_id, event);
        Ok(room.view(now))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Current state snapshot (any caller)
    pub async fn state(&self, room_id: Uuid) -> Result<PlaybackStateView> {
        let handle = self.room_handle(room_id)?;
        let room = handle.lock().await;
        Ok(room.view(self.clock.now_secs()))
    }

    /// Elapsed position clamped to `[0, duration]`
    pub async fn position(&self, room_id: Uuid) -> Result<f64> {
        let handle = self.room_handle(room_id)?;
        let room = handle.lock().await;
        Ok(room.position_at(self.clock.now_secs()))
    }

    /// Drop a deleted room's state and channel
    pub fn forget_room(&self, room_id: Uuid) {
        let removed = self
            .rooms
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&room_id);
        if removed.is_some() {
            debug!("Room {} state released", room_id);
        }
        self.broadcaster.forget_room(room_id);
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Room state for `room_id`, created lazily from the room directory
    fn room_handle(&self, room_id: Uuid) -> Result<Arc<Mutex<Room>>> {
        if let Some(handle) = self
            .rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&room_id)
        {
            return Ok(Arc::clone(handle));
        }

        let administrator_id = self
            .directory
            .administrator_of(room_id)
            .ok_or(Error::RoomNotFound(room_id))?;
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        let handle = rooms.entry(room_id).or_insert_with(|| {
            debug!("Room {} state loaded (administrator {})", room_id, administrator_id);
            Arc::new(Mutex::new(Room::new(room_id, administrator_id)))
        });
        Ok(Arc::clone(handle))
    }

    /// Publish with default priority; delivery problems never fail the request
    fn publish(&self, room_id: Uuid, event: RoomEvent) {
        let event_type = event.event_type();
        if let Err(e) = self.broadcaster.publish_default(room_id, event) {
            warn!("Room {}: {} not broadcast: {}", room_id, event_type, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::ConnectionRegistry;
    use crate::config::BroadcastSettings;
    use crate::playback::directory::InMemoryCatalog;
    use crate::playback::room::Track;
    use tandem_common::ManualClock;

    struct Fixture {
        authority: PlaybackAuthority,
        broadcaster: EventBroadcaster,
        clock: Arc<ManualClock>,
        room_id: Uuid,
        admin: Uuid,
        tracks: Vec<Uuid>,
    }

    fn fixture(track_count: usize) -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000.0));
        let catalog = Arc::new(InMemoryCatalog::new());
        let room_id = Uuid::new_v4();
        let admin = Uuid::new_v4();
        catalog.add_room(room_id, admin);
        let tracks = (0..track_count)
            .map(|_| {
                let track = Track::new(Uuid::new_v4(), 180.0);
                let id = track.id;
                catalog.enqueue_track(room_id, track);
                id
            })
            .collect();

        let broadcaster = EventBroadcaster::new(
            BroadcastSettings::default(),
            Arc::new(ConnectionRegistry::new()),
            clock.clone(),
        );
        let authority = PlaybackAuthority::new(
            catalog.clone(),
            catalog,
            broadcaster.clone(),
            clock.clone(),
        );
        Fixture {
            authority,
            broadcaster,
            clock,
            room_id,
            admin,
            tracks,
        }
    }

    #[tokio::test]
    async fn test_start_stamps_started_at_with_server_time() {
        let f = fixture(1);
        let state = f.authority.start(f.room_id, f.admin, f.tracks[0]).await.unwrap();
        assert!(state.is_playing);
        assert_eq!(state.started_at, Some(1_000.0));
        assert_eq!(state.server_time, 1_000.0);
        assert!(state.paused_at.is_none());
    }

    #[tokio::test]
    async fn test_non_administrator_rejected_before_any_change() {
        let f = fixture(1);
        f.authority.start(f.room_id, f.admin, f.tracks[0]).await.unwrap();
        let before = f.authority.state(f.room_id).await.unwrap();

        let err = f.authority.pause(f.room_id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::Authorization { .. }));
        assert!(err.to_string().contains("administrator"));
        assert_eq!(f.authority.state(f.room_id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_unknown_room_and_track() {
        let f = fixture(0);
        assert!(matches!(
            f.authority.state(Uuid::new_v4()).await,
            Err(Error::RoomNotFound(_))
        ));
        assert!(matches!(
            f.authority.start(f.room_id, f.admin, Uuid::new_v4()).await,
            Err(Error::TrackNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_pause_resume_publish_in_order() {
        let f = fixture(1);
        let mut sub = f.broadcaster.subscribe(f.room_id);

        f.authority.start(f.room_id, f.admin, f.tracks[0]).await.unwrap();
        f.clock.advance(10.0);
        f.authority.pause(f.room_id, f.admin).await.unwrap();
        f.clock.advance(5.0);
        let resumed = f.authority.resume(f.room_id, f.admin).await.unwrap();
        assert_eq!(resumed.started_at, Some(1_005.0));

        let kinds: Vec<String> = [
            sub.recv().await.unwrap(),
            sub.recv().await.unwrap(),
            sub.recv().await.unwrap(),
        ]
        .into_iter()
        .map(|e| e.event_type)
        .collect();
        assert_eq!(kinds, ["PlaybackStarted", "PlaybackPaused", "PlaybackResumed"]);
    }

    #[tokio::test]
    async fn test_skip_from_stopped_starts_queue_head() {
        let f = fixture(2);
        let state = f.authority.skip(f.room_id, f.admin).await.unwrap();
        assert_eq!(state.track_id, Some(f.tracks[0]));
        assert!(state.is_playing);
    }

    #[tokio::test]
    async fn test_position_never_exceeds_duration() {
        let f = fixture(1);
        f.authority.start(f.room_id, f.admin, f.tracks[0]).await.unwrap();
        f.clock.advance(500.0);
        assert_eq!(f.authority.position(f.room_id).await.unwrap(), 180.0);
    }

    #[tokio::test]
    async fn test_concurrent_admin_calls_serialize() {
        let f = Arc::new(fixture(1));
        f.authority.start(f.room_id, f.admin, f.tracks[0]).await.unwrap();

        let a = {
            let f = Arc::clone(&f);
            tokio::spawn(async move { f.authority.pause(f.room_id, f.admin).await })
        };
        let b = {
            let f = Arc::clone(&f);
            tokio::spawn(async move { f.authority.pause(f.room_id, f.admin).await })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];

        // Exactly one pause wins; the other sees the paused state
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(Error::InvalidState(_)))));
    }
}
