//! Registry of live WebSocket connections
//!
//! Each connection task registers a bounded sender here. The broadcaster
//! uses it for the direct delivery path and to count the subscribers a
//! critical event expects confirmations from. A full channel counts as a
//! failed direct send; the pub/sub path still carries the event.
//!
//! Closing goes through a cancellation token rather than the channel so a
//! slow reader can always be told to go away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tandem_common::events::{EventEnvelope, ServerMessage};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Work item for a connection task
#[derive(Debug, Clone)]
pub enum Outbound {
    /// First delivery through the direct path (deduplicated against pub/sub)
    Event(EventEnvelope),
    /// Retry of an unconfirmed critical event (bypasses de-duplication)
    Redeliver(EventEnvelope),
    /// Arbitrary frame for this connection only
    Frame(ServerMessage),
}

/// Handle to one registered connection
#[derive(Debug)]
pub struct ConnectionHandle {
    pub connection_id: Uuid,
    pub room_id: Option<Uuid>,
    pub user_id: Uuid,
    pub is_administrator: bool,
    tx: mpsc::Sender<Outbound>,
    closing: CancellationToken,
    /// Last inbound traffic, epoch milliseconds
    last_seen_ms: AtomicU64,
}

impl ConnectionHandle {
    pub fn new(
        connection_id: Uuid,
        room_id: Option<Uuid>,
        user_id: Uuid,
        is_administrator: bool,
        tx: mpsc::Sender<Outbound>,
        now_secs: f64,
    ) -> Self {
        Self {
            connection_id,
            room_id,
            user_id,
            is_administrator,
            tx,
            closing: CancellationToken::new(),
            last_seen_ms: AtomicU64::new(secs_to_ms(now_secs)),
        }
    }

    /// Queue work for the connection task
    ///
    /// False if the task is gone or its queue is full.
    pub fn send(&self, outbound: Outbound) -> bool {
        match self.tx.try_send(outbound) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Direct queue of connection {} is full", self.connection_id);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the connection task to close its socket
    pub fn close(&self) {
        self.closing.cancel();
    }

    /// Token cancelled by `close`
    pub fn closing(&self) -> CancellationToken {
        self.closing.clone()
    }

    pub fn touch(&self, now_secs: f64) {
        self.last_seen_ms.store(secs_to_ms(now_secs), Ordering::Relaxed);
    }

    pub fn last_seen_secs(&self) -> f64 {
        self.last_seen_ms.load(Ordering::Relaxed) as f64 / 1000.0
    }
}

fn secs_to_ms(secs: f64) -> u64 {
    (secs.max(0.0) * 1000.0) as u64
}

/// Connection id → handle map
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Uuid, Arc<ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: ConnectionHandle) -> Arc<ConnectionHandle> {
        let handle = Arc::new(handle);
        self.write().insert(handle.connection_id, Arc::clone(&handle));
        handle
    }

    /// Remove a connection; returns the handle only on the first call
    pub fn unregister(&self, connection_id: Uuid) -> Option<Arc<ConnectionHandle>> {
        self.write().remove(&connection_id)
    }

    pub fn get(&self, connection_id: Uuid) -> Option<Arc<ConnectionHandle>> {
        self.read().get(&connection_id).cloned()
    }

    pub fn touch(&self, connection_id: Uuid, now_secs: f64) {
        if let Some(handle) = self.read().get(&connection_id) {
            handle.touch(now_secs);
        }
    }

    /// Connections subscribed to `room_id`
    pub fn in_room(&self, room_id: Uuid) -> Vec<Arc<ConnectionHandle>> {
        self.read()
            .values()
            .filter(|h| h.room_id == Some(room_id))
            .cloned()
            .collect()
    }

    /// Connections belonging to `user_id` (any room)
    pub fn for_user(&self, user_id: Uuid) -> Vec<Arc<ConnectionHandle>> {
        self.read()
            .values()
            .filter(|h| h.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<ConnectionHandle>> {
        self.read().values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }

    pub fn count_in_room(&self, room_id: Uuid) -> usize {
        self.read()
            .values()
            .filter(|h| h.room_id == Some(room_id))
            .count()
    }

    /// Whether the room's administrator has at least one live connection
    pub fn administrator_connected(&self, room_id: Uuid) -> bool {
        self.read()
            .values()
            .any(|h| h.room_id == Some(room_id) && h.is_administrator)
    }

    /// Connections with no inbound traffic since `now - stale_after_secs`
    pub fn stale(&self, now_secs: f64, stale_after_secs: f64) -> Vec<Arc<ConnectionHandle>> {
        self.read()
            .values()
            .filter(|h| now_secs - h.last_seen_secs() > stale_after_secs)
            .cloned()
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, Arc<ConnectionHandle>>> {
        self.connections.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, Arc<ConnectionHandle>>> {
        self.connections.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(room_id: Uuid, user_id: Uuid, admin: bool, now: f64) -> (ConnectionHandle, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(8);
        (ConnectionHandle::new(Uuid::new_v4(), Some(room_id), user_id, admin, tx, now), rx)
    }

    #[test]
    fn test_register_and_unregister_once() {
        let registry = ConnectionRegistry::new();
        let room = Uuid::new_v4();
        let (h, _rx) = handle(room, Uuid::new_v4(), false, 0.0);
        let id = h.connection_id;
        registry.register(h);

        assert_eq!(registry.count_in_room(room), 1);
        assert!(registry.unregister(id).is_some());
        assert!(registry.unregister(id).is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_administrator_presence() {
        let registry = ConnectionRegistry::new();
        let room = Uuid::new_v4();
        let (listener, _rx1) = handle(room, Uuid::new_v4(), false, 0.0);
        registry.register(listener);
        assert!(!registry.administrator_connected(room));

        let (admin, _rx2) = handle(room, Uuid::new_v4(), true, 0.0);
        registry.register(admin);
        assert!(registry.administrator_connected(room));
    }

    #[test]
    fn test_stale_detection_uses_last_seen() {
        let registry = ConnectionRegistry::new();
        let room = Uuid::new_v4();
        let (quiet, _rx1) = handle(room, Uuid::new_v4(), false, 0.0);
        let (chatty, _rx2) = handle(room, Uuid::new_v4(), false, 0.0);
        let quiet_id = quiet.connection_id;
        let chatty_id = chatty.connection_id;
        registry.register(quiet);
        registry.register(chatty);

        registry.touch(chatty_id, 80.0);
        let stale: Vec<Uuid> = registry.stale(100.0, 60.0).iter().map(|h| h.connection_id).collect();
        assert_eq!(stale, vec![quiet_id]);
    }

    fn pong() -> Outbound {
        Outbound::Frame(ServerMessage::Pong {
            client_time: 0.0,
            server_time: 0.0,
        })
    }

    #[test]
    fn test_send_fails_after_receiver_dropped() {
        let (h, rx) = handle(Uuid::new_v4(), Uuid::new_v4(), false, 0.0);
        drop(rx);
        assert!(!h.send(pong()));
    }

    #[test]
    fn test_full_queue_rejects_send_but_close_still_works() {
        let (tx, mut rx) = mpsc::channel(2);
        let h = ConnectionHandle::new(Uuid::new_v4(), None, Uuid::new_v4(), false, tx, 0.0);
        let closing = h.closing();

        assert!(h.send(pong()));
        assert!(h.send(pong()));
        assert!(!h.send(pong()));

        // Draining frees room again
        assert!(rx.try_recv().is_ok());
        assert!(h.send(pong()));

        assert!(!closing.is_cancelled());
        h.close();
        assert!(closing.is_cancelled());
    }
}
