//! Room session
//!
//! Ties the pieces together for one listener in one room: frames from the
//! connection manager update the room snapshot and the audio engine, critical
//! events are confirmed, and a sync loop keeps the engine on the timeline.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tandem_common::events::{ClientMessage, EventEnvelope, ServerMessage};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::connection::{ConnectionEvent, ConnectionManager, Connector};
use crate::error::{Error, Result};
use crate::sync::DriftCorrector;

/// Event ids remembered for de-duplication
const SEEN_EVENT_CAPACITY: usize = 512;

/// Bounded set of event ids already applied
struct SeenEvents {
    order: VecDeque<Uuid>,
    ids: HashSet<Uuid>,
}

impl SeenEvents {
    fn new() -> Self {
        Self {
            order: VecDeque::with_capacity(SEEN_EVENT_CAPACITY),
            ids: HashSet::with_capacity(SEEN_EVENT_CAPACITY),
        }
    }

    /// false if `id` was already seen
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > SEEN_EVENT_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

/// One listener's session in a room
pub struct RoomSession {
    connection: ConnectionManager,
    corrector: Arc<DriftCorrector>,
    seen: Mutex<SeenEvents>,
    /// Track currently loaded into the audio engine
    loaded: Mutex<Option<Uuid>>,
    auto_recover: bool,
    shutdown: CancellationToken,
}

impl RoomSession {
    pub fn new(connection: ConnectionManager, corrector: Arc<DriftCorrector>) -> Self {
        Self {
            connection,
            corrector,
            seen: Mutex::new(SeenEvents::new()),
            loaded: Mutex::new(None),
            auto_recover: false,
            shutdown: CancellationToken::new(),
        }
    }

    /// Run force recovery automatically whenever it becomes available
    pub fn with_auto_recovery(mut self, enabled: bool) -> Self {
        self.auto_recover = enabled;
        self
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn corrector(&self) -> &Arc<DriftCorrector> {
        &self.corrector
    }

    /// Token that ends `run()` when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Vote for a queued track (queued while disconnected)
    pub fn vote(&self, track_id: Uuid, value: i32) -> Result<()> {
        info!("Voting {} for track {}", value, track_id);
        self.connection.send(ClientMessage::Vote { track_id, value })
    }

    /// Manual recovery after repeated sync failures
    pub async fn force_recovery(&self) {
        self.corrector.force_recovery().await;
        self.align_audio().await;
    }

    /// Drive the session until shutdown or terminal connectivity loss
    pub async fn run(&self, connector: Arc<dyn Connector>) -> Result<()> {
        let mut events = self.connection.start(connector);
        let sync_task = spawn_sync_loop(
            self.corrector.clone(),
            self.auto_recover,
            self.shutdown.child_token(),
        );

        let result = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                event = events.recv() => match event {
                    Some(ConnectionEvent::Connected) => self.on_connected().await,
                    Some(ConnectionEvent::Message(message)) => self.handle_message(message).await,
                    Some(ConnectionEvent::Reconnecting { attempt, delay }) => {
                        info!("Connection lost; reconnect attempt {} in {:?}", attempt, delay);
                    }
                    Some(ConnectionEvent::Disconnected { fatal: Some(reason) }) => {
                        warn!("Giving up on the room: {}", reason);
                        break Err(Error::ConnectivityLost {
                            attempts: self.connection.reconnect_attempts(),
                        });
                    }
                    Some(ConnectionEvent::Disconnected { fatal: None }) | None => break Ok(()),
                },
            }
        };

        self.shutdown.cancel();
        self.connection.shutdown().await;
        if let Err(e) = sync_task.await {
            warn!("Sync loop ended abnormally: {}", e);
        }
        info!("Session ended");
        result
    }

    async fn on_connected(&self) {
        self.corrector.reset();
        self.corrector.measure_clock().await;
    }

    /// Apply one server frame
    pub async fn handle_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::Welcome {
                connection_id,
                playback_state,
            } => {
                info!(
                    "Joined room {} as connection {}",
                    playback_state.room_id, connection_id
                );
                self.corrector.apply_view(&playback_state);
                self.align_audio().await;
            }
            ServerMessage::Event(envelope) => self.handle_event(envelope).await,
            // Latency is recorded by the connection manager
            ServerMessage::Pong { .. } => {}
            ServerMessage::Error { message } => warn!("Server error: {}", message),
        }
    }

    async fn handle_event(&self, envelope: EventEnvelope) {
        // Confirm even duplicates: a redelivery means our last receipt was lost
        if envelope.priority.requires_confirmation() {
            if let Err(e) = self.connection.send(ClientMessage::Confirm {
                event_id: envelope.event_id,
            }) {
                warn!("Cannot confirm event {}: {}", envelope.event_id, e);
            }
        }

        if !lock(&self.seen).insert(envelope.event_id) {
            debug!("Duplicate event {} ignored", envelope.event_id);
            return;
        }

        let Some(event) = envelope.decode() else {
            debug!("Ignoring unknown event type {}", envelope.event_type);
            return;
        };
        debug!("Event {} ({})", envelope.event_type, envelope.event_id);

        if self.corrector.apply_event(&event) {
            self.align_audio().await;
        }
    }

    /// Bring the audio engine to the room snapshot: track, position, play state
    async fn align_audio(&self) {
        let snapshot = self.corrector.room_snapshot();
        let audio = self.corrector.audio();

        let loaded = *lock(&self.loaded);
        if loaded != snapshot.track_id {
            if let Err(e) = audio.load(snapshot.track_id).await {
                warn!("Cannot load track {:?}: {}", snapshot.track_id, e);
                return;
            }
            *lock(&self.loaded) = snapshot.track_id;
        }
        if snapshot.track_id.is_none() {
            return;
        }

        let expected = self.corrector.expected_position();
        let result = if snapshot.is_playing {
            match audio.seek(expected).await {
                Ok(()) => audio.play().await,
                Err(e) => Err(e),
            }
        } else {
            match audio.pause().await {
                Ok(()) => audio.seek(expected).await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = result {
            // The sync loop will retry the correction
            warn!("Audio alignment failed: {}", e);
        }
    }
}

/// Periodic `synchronize()` until cancelled
fn spawn_sync_loop(
    corrector: Arc<DriftCorrector>,
    auto_recover: bool,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let interval = corrector.next_interval();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            if let Some(outcome) = corrector.synchronize().await {
                let average = outcome.average_drift.unwrap_or(outcome.diff);
                if outcome.corrected {
                    debug!(
                        "Corrected drift of {:.3}s (tolerance {:.3}s, recent average {:.3}s)",
                        outcome.diff, outcome.tolerance, average
                    );
                } else {
                    trace!(
                        "Drift {:.3}s within tolerance {:.3}s (recent average {:.3}s)",
                        outcome.diff, outcome.tolerance, average
                    );
                }
            }

            if auto_recover && corrector.can_force_recovery() {
                corrector.force_recovery().await;
            }
        }
        debug!("Sync loop stopped");
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
