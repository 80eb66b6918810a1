//! External collaborators of the playback authority
//!
//! Room membership/ownership and the vote-ordered track queue are owned by
//! other services. The authority only talks to them through these traits.
//! `InMemoryCatalog` implements both for standalone runs and tests.

use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use super::room::Track;

/// Room ownership lookup (room CRUD service)
pub trait RoomDirectory: Send + Sync + 'static {
    /// Administrator of `room_id`, or None if the room doesn't exist
    fn administrator_of(&self, room_id: Uuid) -> Option<Uuid>;

    /// Track metadata by id
    fn track(&self, track_id: Uuid) -> Option<Track>;

    /// Number of rooms known to the directory
    fn room_count(&self) -> usize;
}

/// Vote-ordered queue (vote tallying service)
pub trait TrackQueue: Send + Sync + 'static {
    /// Track following `current` in vote order
    ///
    /// With `current == None`, or a current track no longer queued, returns
    /// the head of the queue.
    fn next_after(&self, room_id: Uuid, current: Option<Uuid>) -> Option<Track>;

    /// Record a vote, returning the track's new tally (None if not queued)
    fn record_vote(&self, room_id: Uuid, track_id: Uuid, user_id: Uuid, value: i32) -> Option<i64>;
}

#[derive(Debug, Clone)]
struct QueueEntry {
    track_id: Uuid,
    votes: i64,
    /// Insertion sequence, breaks vote ties
    seq: u64,
    voters: HashMap<Uuid, i32>,
}

#[derive(Debug, Default)]
struct CatalogInner {
    rooms: HashMap<Uuid, Uuid>,
    tracks: HashMap<Uuid, Track>,
    queues: HashMap<Uuid, Vec<QueueEntry>>,
    next_seq: u64,
}

/// In-process room directory and track queue
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    inner: RwLock<CatalogInner>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a room and its administrator
    pub fn add_room(&self, room_id: Uuid, administrator_id: Uuid) {
        let mut inner = self.write();
        inner.rooms.insert(room_id, administrator_id);
        inner.queues.entry(room_id).or_default();
    }

    /// Remove a room and its queue
    pub fn remove_room(&self, room_id: Uuid) {
        let mut inner = self.write();
        inner.rooms.remove(&room_id);
        inner.queues.remove(&room_id);
    }

    /// Register a track and append it to `room_id`'s queue
    pub fn enqueue_track(&self, room_id: Uuid, track: Track) {
        let mut inner = self.write();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let track_id = track.id;
        inner.tracks.insert(track_id, track);
        inner.queues.entry(room_id).or_default().push(QueueEntry {
            track_id,
            votes: 0,
            seq,
            voters: HashMap::new(),
        });
    }

    /// Queue of `room_id` in vote order
    pub fn queue_order(&self, room_id: Uuid) -> Vec<Uuid> {
        let inner = self.read();
        let Some(queue) = inner.queues.get(&room_id) else {
            return Vec::new();
        };
        let mut entries: Vec<&QueueEntry> = queue.iter().collect();
        entries.sort_by(|a, b| b.votes.cmp(&a.votes).then(a.seq.cmp(&b.seq)));
        entries.into_iter().map(|e| e.track_id).collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CatalogInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CatalogInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl RoomDirectory for InMemoryCatalog {
    fn administrator_of(&self, room_id: Uuid) -> Option<Uuid> {
        self.read().rooms.get(&room_id).copied()
    }

    fn track(&self, track_id: Uuid) -> Option<Track> {
        self.read().tracks.get(&track_id).cloned()
    }

    fn room_count(&self) -> usize {
        self.read().rooms.len()
    }
}

impl TrackQueue for InMemoryCatalog {
    fn next_after(&self, room_id: Uuid, current: Option<Uuid>) -> Option<Track> {
        let order = self.queue_order(room_id);
        let next_id = match current.and_then(|c| order.iter().position(|id| *id == c)) {
            Some(idx) => order.get(idx + 1).copied(),
            None => order.iter().copied().find(|id| Some(*id) != current),
        }?;
        self.track(next_id)
    }

    fn record_vote(&self, room_id: Uuid, track_id: Uuid, user_id: Uuid, value: i32) -> Option<i64> {
        let mut inner = self.write();
        let entry = inner
            .queues
            .get_mut(&room_id)?
            .iter_mut()
            .find(|e| e.track_id == track_id)?;

        // One vote per user; a repeat vote replaces the previous one
        let value = value.signum();
        let previous = entry.voters.insert(user_id, value).unwrap_or(0);
        entry.votes += i64::from(value - previous);
        Some(entry.votes)
    }
}
