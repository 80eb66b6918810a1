//! Connection manager
//!
//! Owns the room socket for one client. A background task connects,
//! drains the outbound queue, pumps frames until the socket drops, then
//! backs off and reconnects. Messages sent while disconnected wait in the
//! bounded queue and go out in order once connected.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tandem_common::events::{ClientMessage, ServerMessage};
use tandem_common::Clock;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::breaker::CircuitBreaker;
use super::health::{HealthMetrics, HealthSnapshot};
use super::queue::MessageQueue;
use super::state::ConnectionState;
use super::transport::{Connector, Transport};
use crate::config::ConnectionSettings;
use crate::error::{Error, Result};

/// Capacity of the event channel handed to the session
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Floor of the latency probe period (tokio intervals reject zero)
const MIN_PING_INTERVAL: Duration = Duration::from_millis(100);

/// What the manager reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Socket established (initially or after a reconnect)
    Connected,
    /// Frame from the server
    Message(ServerMessage),
    /// Socket lost; next attempt after `delay`
    Reconnecting { attempt: u32, delay: Duration },
    /// Manager stopped; `fatal` carries the error when connectivity was lost
    Disconnected { fatal: Option<String> },
}

/// How a connected session ended
enum SessionEnd {
    Shutdown,
    Clean,
    Unclean(Error),
}

struct Inner {
    settings: ConnectionSettings,
    clock: Arc<dyn Clock>,
    state_tx: watch::Sender<ConnectionState>,
    queue: Mutex<MessageQueue>,
    health: Mutex<HealthMetrics>,
    attempts: AtomicU32,
    outbound: Notify,
    stopped: AtomicBool,
    shutdown: CancellationToken,
}

/// Resilient room connection
pub struct ConnectionManager {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(settings: ConnectionSettings, clock: Arc<dyn Clock>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let queue = MessageQueue::new(settings.queue_capacity, settings.max_send_retries);
        let health = HealthMetrics::new(settings.latency_ema_alpha);
        Self {
            inner: Arc::new(Inner {
                settings,
                clock,
                state_tx,
                queue: Mutex::new(queue),
                health: Mutex::new(health),
                attempts: AtomicU32::new(0),
                outbound: Notify::new(),
                stopped: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Spawn the connection task; frames and lifecycle changes arrive on the receiver
    pub fn start(&self, connector: Arc<dyn Connector>) -> mpsc::Receiver<ConnectionEvent> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            run(inner, connector, events_tx).await;
        });
        if let Some(previous) = lock(&self.task).replace(handle) {
            warn!("Connection manager restarted; aborting previous task");
            previous.abort();
        }
        events_rx
    }

    /// Queue a message for delivery
    ///
    /// Goes out immediately while connected, otherwise when the connection
    /// comes back. Fails only once the manager has stopped.
    pub fn send(&self, message: ClientMessage) -> Result<()> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(Error::Send("connection manager stopped".to_string()));
        }
        if lock(&self.inner.queue).push(message).is_some() {
            lock(&self.inner.health).message_lost();
        }
        self.inner.outbound.notify_one();
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Consecutive failed attempts in the current outage (0 while connected)
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> HealthSnapshot {
        lock(&self.inner.health).snapshot()
    }

    /// Messages waiting to be sent
    pub fn queued(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    /// Stop the connection task and wait for it to close the socket
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handle = lock(&self.task).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Connection task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

// ============================================================================
// Connection task
// ============================================================================

async fn run(
    inner: Arc<Inner>,
    connector: Arc<dyn Connector>,
    events: mpsc::Sender<ConnectionEvent>,
) {
    let mut backoff = Backoff::new(&inner.settings);
    let mut breaker = CircuitBreaker::new(
        inner.settings.breaker_threshold,
        inner.settings.breaker_cooldown(),
    );
    let mut retry_floor = Duration::ZERO;

    inner.set_state(ConnectionState::Connecting);

    loop {
        let attempt = match breaker.check() {
            Err(retry_in) => Err(Error::CircuitOpen { retry_in }),
            Ok(()) => {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => {
                        stop(&inner, &events, None).await;
                        return;
                    }
                    result = connector.connect() => result,
                }
            }
        };

        match attempt {
            Ok(mut transport) => {
                breaker.record_success();
                backoff.reset();
                inner.attempts.store(0, Ordering::SeqCst);
                lock(&inner.health).connection_succeeded();
                inner.set_state(ConnectionState::Connected);
                info!("Connected to room channel");
                emit(&events, ConnectionEvent::Connected).await;

                let end = session(&inner, transport.as_mut(), &events).await;
                lock(&inner.health).connection_lost();

                match end {
                    SessionEnd::Shutdown => {
                        if let Err(e) = transport.close().await {
                            debug!("Close on shutdown failed: {}", e);
                        }
                        stop(&inner, &events, None).await;
                        return;
                    }
                    SessionEnd::Clean => {
                        info!("Room channel closed by server");
                        stop(&inner, &events, None).await;
                        return;
                    }
                    SessionEnd::Unclean(e) => {
                        warn!("Room channel dropped: {}", e);
                    }
                }
            }
            Err(Error::CircuitOpen { retry_in }) => {
                debug!("Connection attempt short-circuited, breaker open for {:?}", retry_in);
                retry_floor = retry_in;
            }
            Err(e) => {
                breaker.record_failure();
                lock(&inner.health).connection_failed();
                warn!("Connection attempt {} failed: {}", backoff.attempt(), e);
            }
        }

        let Some(delay) = backoff.next_delay_at_least(std::mem::take(&mut retry_floor)) else {
            let fatal = Error::ConnectivityLost {
                attempts: backoff.attempt(),
            };
            error!("{}", fatal);
            stop(&inner, &events, Some(fatal.to_string())).await;
            return;
        };
        let attempt = backoff.attempt();
        inner.attempts.store(attempt, Ordering::SeqCst);
        inner.set_state(ConnectionState::Reconnecting);
        info!("Reconnect attempt {} in {:?}", attempt, delay);
        emit(&events, ConnectionEvent::Reconnecting { attempt, delay }).await;

        tokio::select! {
            _ = inner.shutdown.cancelled() => {
                stop(&inner, &events, None).await;
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
        inner.set_state(ConnectionState::Connecting);
    }
}

/// Pump one connected socket until it ends
async fn session(
    inner: &Inner,
    transport: &mut dyn Transport,
    events: &mpsc::Sender<ConnectionEvent>,
) -> SessionEnd {
    if let Err(e) = drain_queue(inner, transport).await {
        return SessionEnd::Unclean(e);
    }

    let period = inner.settings.ping_interval().max(MIN_PING_INTERVAL);
    let mut ping = interval_at(Instant::now() + period, period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return SessionEnd::Shutdown,

            _ = inner.outbound.notified() => {
                if let Err(e) = drain_queue(inner, transport).await {
                    return SessionEnd::Unclean(e);
                }
            }

            _ = ping.tick() => {
                let probe = ClientMessage::Ping { client_time: inner.clock.now_millis() };
                if let Err(e) = send_message(inner, transport, &probe).await {
                    return SessionEnd::Unclean(e);
                }
            }

            incoming = transport.recv() => match incoming {
                Some(Ok(text)) => {
                    lock(&inner.health).message_received();
                    match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(message) => {
                            if let ServerMessage::Pong { client_time, .. } = &message {
                                let rtt = inner.clock.now_millis() - client_time;
                                lock(&inner.health).record_latency(rtt);
                            }
                            emit(events, ConnectionEvent::Message(message)).await;
                        }
                        Err(e) => warn!("Ignoring malformed server frame: {}", e),
                    }
                }
                Some(Err(e)) => return SessionEnd::Unclean(e),
                None => return SessionEnd::Clean,
            },
        }
    }
}

/// Send queued messages in order; a failed send stays at the head
async fn drain_queue(inner: &Inner, transport: &mut dyn Transport) -> Result<()> {
    loop {
        let Some(entry) = lock(&inner.queue).pop_front() else {
            return Ok(());
        };
        let text = match serde_json::to_string(&entry.message) {
            Ok(text) => text,
            Err(e) => {
                warn!("Dropping unserializable message: {}", e);
                lock(&inner.health).message_lost();
                continue;
            }
        };
        match transport.send(text).await {
            Ok(()) => lock(&inner.health).message_sent(),
            Err(e) => {
                if !lock(&inner.queue).requeue_front(entry) {
                    lock(&inner.health).message_lost();
                }
                return Err(e);
            }
        }
    }
}

async fn send_message(
    inner: &Inner,
    transport: &mut dyn Transport,
    message: &ClientMessage,
) -> Result<()> {
    let text = serde_json::to_string(message)?;
    transport.send(text).await?;
    lock(&inner.health).message_sent();
    Ok(())
}

async fn stop(inner: &Inner, events: &mpsc::Sender<ConnectionEvent>, fatal: Option<String>) {
    inner.stopped.store(true, Ordering::SeqCst);
    inner.set_state(ConnectionState::Disconnected);
    emit(events, ConnectionEvent::Disconnected { fatal }).await;
}

async fn emit(events: &mpsc::Sender<ConnectionEvent>, event: ConnectionEvent) {
    if events.send(event).await.is_err() {
        debug!("Connection event receiver dropped");
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("Connection state {} -> {}", previous, state);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
