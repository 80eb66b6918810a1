//! Room event broadcaster
//!
//! Every published event travels two paths: the room's pub/sub channel
//! (tokio broadcast, also feeding SSE listeners) and a direct send to each
//! registered connection. Either path succeeding counts as delivered;
//! connection tasks drop the duplicate by event id.
//!
//! Priority only changes bookkeeping. Critical events are kept in a
//! pending-confirmation table until every subscriber that was connected at
//! publish time confirms, or the confirmation timer fires. This is
//! best-effort: nothing here guarantees delivery.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tandem_common::events::{EventEnvelope, EventPriority, RoomEvent};
use tandem_common::Clock;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::registry::{ConnectionHandle, ConnectionRegistry, Outbound};
use crate::config::BroadcastSettings;
use crate::error::{Error, Result};

/// Outcome of a publish call (per room, not per subscriber)
#[derive(Debug, Clone, PartialEq)]
pub struct PublishReceipt {
    pub event_id: Uuid,
    /// Receivers reached through the pub/sub channel
    pub pubsub_receivers: usize,
    /// Connections reached through the direct path
    pub direct_deliveries: usize,
    /// Whether confirmations are being tracked
    pub tracked: bool,
}

/// Broadcaster counters
#[derive(Debug, Default)]
struct BroadcastStats {
    published: AtomicU64,
    tracked: AtomicU64,
    confirmations: AtomicU64,
    fully_confirmed: AtomicU64,
    delivery_timeouts: AtomicU64,
    redeliveries: AtomicU64,
}

/// Point-in-time copy of the broadcaster counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BroadcastStatsSnapshot {
    pub published: u64,
    pub tracked: u64,
    pub confirmations: u64,
    pub fully_confirmed: u64,
    pub delivery_timeouts: u64,
    pub redeliveries: u64,
}

#[derive(Debug)]
struct PendingDelivery {
    envelope: EventEnvelope,
    expected: HashSet<Uuid>,
    confirmed: HashSet<Uuid>,
    retried: bool,
}

struct Inner {
    settings: BroadcastSettings,
    clock: Arc<dyn Clock>,
    registry: Arc<ConnectionRegistry>,
    channels: RwLock<HashMap<Uuid, broadcast::Sender<EventEnvelope>>>,
    pending: Mutex<HashMap<Uuid, PendingDelivery>>,
    stats: BroadcastStats,
    shutdown: CancellationToken,
}

/// Fans room events out to subscribers
#[derive(Clone)]
pub struct EventBroadcaster {
    inner: Arc<Inner>,
}

impl EventBroadcaster {
    /// Create a broadcaster over an existing connection registry
    pub fn new(
        settings: BroadcastSettings,
        registry: Arc<ConnectionRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        info!(
            "Event broadcaster initialized (channel capacity {}, confirmation timeout {}ms)",
            settings.channel_capacity, settings.confirmation_timeout_ms
        );
        Self {
            inner: Arc::new(Inner {
                settings,
                clock,
                registry,
                channels: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                stats: BroadcastStats::default(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.inner.registry
    }

    /// Bound of each connection's direct queue (same as the pub/sub channel)
    pub fn direct_capacity(&self) -> usize {
        self.inner.settings.channel_capacity.max(1)
    }

    /// Subscribe to a room's pub/sub channel
    pub fn subscribe(&self, room_id: Uuid) -> broadcast::Receiver<EventEnvelope> {
        self.inner.channel(room_id).subscribe()
    }

    /// Drop a room's channel (room deleted)
    pub fn forget_room(&self, room_id: Uuid) {
        let mut channels = self.inner.channels.write().unwrap_or_else(|e| e.into_inner());
        channels.remove(&room_id);
    }

    /// Publish an event to every subscriber of `room_id`
    pub fn publish(
        &self,
        room_id: Uuid,
        event: RoomEvent,
        priority: EventPriority,
    ) -> Result<PublishReceipt> {
        let envelope = self.envelope(Some(room_id), &event, priority)?;
        let channels = vec![self.inner.channel(room_id)];
        let targets = self.inner.registry.in_room(room_id);
        debug!(
            "Publishing {} ({}) to room {} [{}]",
            envelope.event_type, envelope.event_id, room_id, priority
        );
        self.deliver(envelope, &channels, targets)
    }

    /// Publish with the event's default priority
    pub fn publish_default(&self, room_id: Uuid, event: RoomEvent) -> Result<PublishReceipt> {
        let priority = event.default_priority();
        self.publish(room_id, event, priority)
    }

    /// Publish `RoomUpdated` with the room's current presence counts
    pub fn publish_room_update(&self, room_id: Uuid) -> Result<PublishReceipt> {
        let registry = &self.inner.registry;
        let event = RoomEvent::RoomUpdated {
            administrator_connected: registry.administrator_connected(room_id),
            listener_count: registry.count_in_room(room_id),
            server_time: self.inner.clock.now_secs(),
        };
        self.publish_default(room_id, event)
    }

    /// Direct-send an event to every connection of one user
    pub fn broadcast_to_user(
        &self,
        user_id: Uuid,
        event: RoomEvent,
        priority: EventPriority,
    ) -> Result<PublishReceipt> {
        let envelope = self.envelope(None, &event, priority)?;
        let targets = self.inner.registry.for_user(user_id);
        self.deliver(envelope, &[], targets)
    }

    /// Send an event to every room channel and every connection
    pub fn broadcast_global(
        &self,
        event: RoomEvent,
        priority: EventPriority,
    ) -> Result<PublishReceipt> {
        let envelope = self.envelope(None, &event, priority)?;
        let channels: Vec<_> = {
            let channels = self.inner.channels.read().unwrap_or_else(|e| e.into_inner());
            channels.values().cloned().collect()
        };
        let targets = self.inner.registry.all();
        self.deliver(envelope, &channels, targets)
    }

    /// Record a subscriber's receipt of a critical event
    ///
    /// Returns false if the event isn't tracked (already settled, never
    /// critical) or the connection wasn't expected to confirm it.
    pub fn confirm(&self, event_id: Uuid, connection_id: Uuid) -> bool {
        let mut pending = self.inner.lock_pending();
        let Some(entry) = pending.get_mut(&event_id) else {
            debug!("Confirmation for untracked event {}", event_id);
            return false;
        };
        if !entry.expected.contains(&connection_id) {
            return false;
        }

        entry.confirmed.insert(connection_id);
        self.inner.stats.confirmations.fetch_add(1, Ordering::Relaxed);

        if entry.confirmed.len() >= entry.expected.len() {
            pending.remove(&event_id);
            self.inner.stats.fully_confirmed.fetch_add(1, Ordering::Relaxed);
            debug!("Event {} confirmed by all subscribers", event_id);
        }
        true
    }

    /// Number of critical events still awaiting confirmations
    pub fn pending_count(&self) -> usize {
        self.inner.lock_pending().len()
    }

    /// `(confirmed, expected)` for a tracked event
    pub fn confirmation_progress(&self, event_id: Uuid) -> Option<(usize, usize)> {
        let pending = self.inner.lock_pending();
        pending
            .get(&event_id)
            .map(|e| (e.confirmed.len(), e.expected.len()))
    }

    pub fn stats(&self) -> BroadcastStatsSnapshot {
        let s = &self.inner.stats;
        BroadcastStatsSnapshot {
            published: s.published.load(Ordering::Relaxed),
            tracked: s.tracked.load(Ordering::Relaxed),
            confirmations: s.confirmations.load(Ordering::Relaxed),
            fully_confirmed: s.fully_confirmed.load(Ordering::Relaxed),
            delivery_timeouts: s.delivery_timeouts.load(Ordering::Relaxed),
            redeliveries: s.redeliveries.load(Ordering::Relaxed),
        }
    }

    /// Cancel confirmation timers
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    fn envelope(
        &self,
        room_id: Option<Uuid>,
        event: &RoomEvent,
        priority: EventPriority,
    ) -> Result<EventEnvelope> {
        Ok(EventEnvelope::new(
            room_id,
            event,
            priority,
            self.inner.clock.now_secs(),
        )?)
    }

    fn deliver(
        &self,
        envelope: EventEnvelope,
        channels: &[broadcast::Sender<EventEnvelope>],
        targets: Vec<Arc<ConnectionHandle>>,
    ) -> Result<PublishReceipt> {
        self.inner.stats.published.fetch_add(1, Ordering::Relaxed);

        // Track before sending: a fast subscriber may confirm before we return
        let event_id = envelope.event_id;
        let tracked = envelope.priority.requires_confirmation() && !targets.is_empty();
        if tracked {
            let expected: HashSet<Uuid> = targets.iter().map(|h| h.connection_id).collect();
            self.inner.lock_pending().insert(
                event_id,
                PendingDelivery {
                    envelope: envelope.clone(),
                    expected,
                    confirmed: HashSet::new(),
                    retried: false,
                },
            );
        }

        // Path 1: pub/sub (no receivers is not an error)
        let pubsub_receivers: usize = channels
            .iter()
            .map(|tx| tx.send(envelope.clone()).unwrap_or(0))
            .sum();

        // Path 2: direct per-connection send
        let mut reached = HashSet::new();
        for handle in &targets {
            if handle.send(Outbound::Event(envelope.clone())) {
                reached.insert(handle.connection_id);
            }
        }
        let direct_deliveries = reached.len();

        if !targets.is_empty() && pubsub_receivers == 0 && direct_deliveries == 0 {
            if tracked {
                self.inner.lock_pending().remove(&event_id);
            }
            warn!(
                "Event {} reached none of {} subscriber(s)",
                envelope.event_id,
                targets.len()
            );
            return Err(Error::Broadcast(format!(
                "event {} not delivered on either path",
                envelope.event_id
            )));
        }

        if tracked {
            self.inner.stats.tracked.fetch_add(1, Ordering::Relaxed);
            Inner::schedule_check(&self.inner, event_id);
        }

        Ok(PublishReceipt {
            event_id,
            pubsub_receivers,
            direct_deliveries,
            tracked,
        })
    }
}

impl Inner {
    fn lock_pending(&self) -> MutexGuard<'_, HashMap<Uuid, PendingDelivery>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn channel(&self, room_id: Uuid) -> broadcast::Sender<EventEnvelope> {
        if let Some(tx) = self
            .channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&room_id)
        {
            return tx.clone();
        }
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(room_id)
            .or_insert_with(|| broadcast::channel(self.settings.channel_capacity.max(1)).0)
            .clone()
    }

    fn schedule_check(inner: &Arc<Inner>, event_id: Uuid) {
        let inner = Arc::clone(inner);
        let timeout = inner.settings.confirmation_timeout();
        let token = inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => Inner::check_confirmations(&inner, event_id),
            }
        });
    }

    fn check_confirmations(inner: &Arc<Inner>, event_id: Uuid) {
        let mut pending = inner.lock_pending();
        let Some(entry) = pending.get_mut(&event_id) else {
            return;
        };

        // Subscribers that disconnected since publish can't confirm
        let missing: Vec<Arc<ConnectionHandle>> = entry
            .expected
            .difference(&entry.confirmed)
            .filter_map(|id| inner.registry.get(*id))
            .collect();

        if missing.is_empty() {
            pending.remove(&event_id);
            return;
        }

        inner.stats.delivery_timeouts.fetch_add(1, Ordering::Relaxed);
        let timeout = Error::DeliveryTimeout {
            event_id,
            missing: missing.len(),
        };

        if inner.settings.retry_unconfirmed && !entry.retried {
            entry.retried = true;
            let envelope = entry.envelope.clone();
            drop(pending);

            warn!("{} ({}), retrying once", timeout, envelope.event_type);
            for handle in &missing {
                if handle.send(Outbound::Redeliver(envelope.clone())) {
                    inner.stats.redeliveries.fetch_add(1, Ordering::Relaxed);
                }
            }
            Inner::schedule_check(inner, event_id);
        } else {
            warn!("{} ({}), giving up", timeout, entry.envelope.event_type);
            pending.remove(&event_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tandem_common::ManualClock;
    use tokio::sync::mpsc;

    fn broadcaster(retry: bool) -> EventBroadcaster {
        let settings = BroadcastSettings {
            channel_capacity: 16,
            confirmation_timeout_ms: 5000,
            retry_unconfirmed: retry,
        };
        EventBroadcaster::new(
            settings,
            Arc::new(ConnectionRegistry::new()),
            Arc::new(ManualClock::new(1_000.0)),
        )
    }

    fn connect(
        broadcaster: &EventBroadcaster,
        room_id: Uuid,
    ) -> (Uuid, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(16);
        let id = Uuid::new_v4();
        broadcaster.registry().register(ConnectionHandle::new(
            id,
            Some(room_id),
            Uuid::new_v4(),
            false,
            tx,
            1_000.0,
        ));
        (id, rx)
    }

    fn started() -> RoomEvent {
        RoomEvent::PlaybackStarted {
            track_id: Uuid::new_v4(),
            duration: 180.0,
            started_at: 1_000.0,
            server_time: 1_000.0,
        }
    }

    #[tokio::test]
    async fn test_publish_uses_both_paths_and_stamps_time() {
        let b = broadcaster(false);
        let room = Uuid::new_v4();
        let mut sub = b.subscribe(room);
        let (_id, mut rx) = connect(&b, room);

        let receipt = b.publish(room, started(), EventPriority::Normal).unwrap();
        assert_eq!(receipt.pubsub_receivers, 1);
        assert_eq!(receipt.direct_deliveries, 1);
        assert!(!receipt.tracked);

        let via_pubsub = sub.recv().await.unwrap();
        assert_eq!(via_pubsub.event_id, receipt.event_id);
        assert_eq!(via_pubsub.server_time, 1_000.0);
        match rx.recv().await.unwrap() {
            Outbound::Event(env) => assert_eq!(env.event_id, receipt.event_id),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_succeeds() {
        let b = broadcaster(false);
        let receipt = b
            .publish(Uuid::new_v4(), started(), EventPriority::Critical)
            .unwrap();
        assert_eq!(receipt.pubsub_receivers, 0);
        assert!(!receipt.tracked);
        assert_eq!(b.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_fails_when_no_path_reaches_subscribers() {
        let b = broadcaster(false);
        let room = Uuid::new_v4();
        let (_id, rx) = connect(&b, room);
        drop(rx);
        let result = b.publish(room, started(), EventPriority::Normal);
        assert!(matches!(result, Err(Error::Broadcast(_))));
    }

    #[tokio::test]
    async fn test_critical_event_settles_when_all_confirm() {
        let b = broadcaster(false);
        let room = Uuid::new_v4();
        let (a, _rx_a) = connect(&b, room);
        let (c, _rx_c) = connect(&b, room);

        let receipt = b.publish(room, started(), EventPriority::Critical).unwrap();
        assert!(receipt.tracked);
        assert_eq!(b.confirmation_progress(receipt.event_id), Some((0, 2)));

        assert!(b.confirm(receipt.event_id, a));
        assert_eq!(b.confirmation_progress(receipt.event_id), Some((1, 2)));
        assert!(b.confirm(receipt.event_id, c));
        assert_eq!(b.pending_count(), 0);
        assert_eq!(b.stats().fully_confirmed, 1);

        // Late duplicate confirmation is ignored
        assert!(!b.confirm(receipt.event_id, a));
    }

    #[tokio::test]
    async fn test_undelivered_critical_event_is_not_left_pending() {
        let b = broadcaster(true);
        let room = Uuid::new_v4();
        let (_id, rx) = connect(&b, room);
        drop(rx);
        let result = b.publish(room, started(), EventPriority::Critical);
        assert!(matches!(result, Err(Error::Broadcast(_))));
        assert_eq!(b.pending_count(), 0);
        assert_eq!(b.stats().tracked, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_immediate_confirmation_is_never_untracked() {
        let b = broadcaster(true);
        let room = Uuid::new_v4();
        // Room for every event so the direct path never refuses
        let (tx, mut rx) = mpsc::channel(256);
        let id = Uuid::new_v4();
        b.registry()
            .register(ConnectionHandle::new(id, Some(room), Uuid::new_v4(), false, tx, 0.0));

        // Subscriber confirms the instant the event lands in its queue
        let confirmer = b.clone();
        let subscriber = tokio::spawn(async move {
            let mut accepted = 0;
            while let Some(outbound) = rx.recv().await {
                if let Outbound::Event(envelope) = outbound {
                    if confirmer.confirm(envelope.event_id, id) {
                        accepted += 1;
                    }
                }
            }
            accepted
        });

        for _ in 0..200 {
            b.publish(room, started(), EventPriority::Critical).unwrap();
        }
        b.registry().unregister(id);
        let accepted = subscriber.await.unwrap();

        assert_eq!(accepted, 200);
        assert_eq!(b.pending_count(), 0);
        assert_eq!(b.stats().fully_confirmed, 200);
    }

    #[tokio::test]
    async fn test_full_direct_queue_falls_back_to_pubsub() {
        let b = broadcaster(false);
        let room = Uuid::new_v4();
        let mut sub = b.subscribe(room);
        let (tx, _rx) = mpsc::channel(1);
        b.registry()
            .register(ConnectionHandle::new(Uuid::new_v4(), Some(room), Uuid::new_v4(), false, tx, 0.0));

        let first = b.publish(room, started(), EventPriority::Normal).unwrap();
        assert_eq!(first.direct_deliveries, 1);

        // Reader never drains: direct path refuses, pub/sub still carries it
        let second = b.publish(room, started(), EventPriority::Normal).unwrap();
        assert_eq!(second.direct_deliveries, 0);
        assert_eq!(second.pubsub_receivers, 1);
        assert_eq!(sub.recv().await.unwrap().event_id, first.event_id);
        assert_eq!(sub.recv().await.unwrap().event_id, second.event_id);
    }

    #[tokio::test]
    async fn test_unexpected_connection_cannot_confirm() {
        let b = broadcaster(false);
        let room = Uuid::new_v4();
        let (_a, _rx) = connect(&b, room);
        let receipt = b.publish(room, started(), EventPriority::Critical).unwrap();
        assert!(!b.confirm(receipt.event_id, Uuid::new_v4()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_event_retried_once_then_dropped() {
        let b = broadcaster(true);
        let room = Uuid::new_v4();
        let (_a, mut rx) = connect(&b, room);

        let receipt = b.publish(room, started(), EventPriority::Critical).unwrap();
        assert!(matches!(rx.recv().await, Some(Outbound::Event(_))));

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        match rx.recv().await {
            Some(Outbound::Redeliver(env)) => assert_eq!(env.event_id, receipt.event_id),
            other => panic!("expected redelivery, got {:?}", other),
        }
        assert_eq!(b.pending_count(), 1);

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(b.pending_count(), 0);
        let stats = b.stats();
        assert_eq!(stats.delivery_timeouts, 2);
        assert_eq!(stats.redeliveries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_retry_logs_and_drops() {
        let b = broadcaster(false);
        let room = Uuid::new_v4();
        let (_a, _rx) = connect(&b, room);
        b.publish(room, started(), EventPriority::Critical).unwrap();

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(b.pending_count(), 0);
        assert_eq!(b.stats().delivery_timeouts, 1);
        assert_eq!(b.stats().redeliveries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_subscriber_not_counted_as_missing() {
        let b = broadcaster(true);
        let room = Uuid::new_v4();
        let (a, _rx) = connect(&b, room);
        b.publish(room, started(), EventPriority::Critical).unwrap();
        b.registry().unregister(a);

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(b.pending_count(), 0);
        assert_eq!(b.stats().delivery_timeouts, 0);
    }

    #[tokio::test]
    async fn test_broadcast_to_user_targets_only_that_user() {
        let b = broadcaster(false);
        let room = Uuid::new_v4();
        let (_other, mut other_rx) = connect(&b, room);
        let (tx, mut rx) = mpsc::channel(16);
        let user = Uuid::new_v4();
        b.registry().register(ConnectionHandle::new(Uuid::new_v4(), Some(room), user, false, tx, 0.0));

        let receipt = b
            .broadcast_to_user(user, RoomEvent::UserLeft { user_id: user }, EventPriority::Low)
            .unwrap();
        assert_eq!(receipt.direct_deliveries, 1);
        assert!(matches!(rx.recv().await, Some(Outbound::Event(_))));
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_global_reaches_every_room() {
        let b = broadcaster(false);
        let (room_a, room_b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut sub_a = b.subscribe(room_a);
        let mut sub_b = b.subscribe(room_b);

        let event = RoomEvent::RoomUpdated {
            administrator_connected: false,
            listener_count: 0,
            server_time: 1_000.0,
        };
        let receipt = b.broadcast_global(event, EventPriority::Low).unwrap();
        assert_eq!(receipt.pubsub_receivers, 2);
        assert!(sub_a.recv().await.unwrap().room_id.is_none());
        assert!(sub_b.recv().await.is_ok());
    }
}
