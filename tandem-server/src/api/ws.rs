//! Room WebSocket channel
//!
//! One connection task per socket. The task registers itself with the
//! connection registry (direct path) and subscribes to the room's pub/sub
//! channel, then multiplexes both sources plus inbound client frames. An
//! event arriving on both paths is forwarded once; redeliveries of
//! unconfirmed critical events are always forwarded.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::{HashSet, VecDeque};
use tandem_common::events::{ClientMessage, RoomEvent, ServerMessage};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::server::AppContext;
use crate::broadcast::{announce_departure, ConnectionHandle, Outbound};
use crate::error::Result;

/// Event ids remembered per connection for de-duplication
const RECENT_EVENT_CAPACITY: usize = 256;

/// Query string of the WebSocket upgrade request
#[derive(Debug, Deserialize)]
pub struct SocketParams {
    pub user_id: Uuid,
}

/// GET /api/v1/rooms/:room_id/ws - Room event channel
pub async fn room_socket(
    ws: WebSocketUpgrade,
    State(ctx): State<AppContext>,
    Path(room_id): Path<Uuid>,
    Query(params): Query<SocketParams>,
) -> Result<Response> {
    // Unknown rooms are rejected before the upgrade
    ctx.authority.state(room_id).await?;
    info!("User {} connecting to room {}", params.user_id, room_id);
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, ctx, room_id, params.user_id)))
}

/// Bounded set of recently forwarded event ids
struct RecentEvents {
    order: VecDeque<Uuid>,
    ids: HashSet<Uuid>,
    capacity: usize,
}

impl RecentEvents {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `id`; false if it was already seen
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

type SocketSender = SplitSink<WebSocket, Message>;

async fn handle_socket(socket: WebSocket, ctx: AppContext, room_id: Uuid, user_id: Uuid) {
    let connection_id = Uuid::new_v4();
    let is_administrator = ctx.authority.is_administrator(room_id, user_id);
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before reading state so no transition falls in between
    let mut room_rx = ctx.broadcaster.subscribe(room_id);
    let (direct_tx, mut direct_rx) = mpsc::channel(ctx.broadcaster.direct_capacity());
    let closing = ctx.broadcaster.registry().register(ConnectionHandle::new(
        connection_id,
        Some(room_id),
        user_id,
        is_administrator,
        direct_tx,
        ctx.clock.now_secs(),
    )).closing();
    info!(
        "Connection {} registered (room {}, user {}{})",
        connection_id,
        room_id,
        user_id,
        if is_administrator { ", administrator" } else { "" }
    );

    let welcome = match ctx.authority.state(room_id).await {
        Ok(playback_state) => ServerMessage::Welcome {
            connection_id,
            playback_state,
        },
        Err(e) => {
            warn!("Room {} unavailable for {}: {}", room_id, connection_id, e);
            disconnect(&ctx, connection_id);
            return;
        }
    };
    if send_frame(&mut sender, &welcome).await.is_err() {
        disconnect(&ctx, connection_id);
        return;
    }

    announce_arrival(&ctx, room_id, user_id, is_administrator);

    let mut recent = RecentEvents::new(RECENT_EVENT_CAPACITY);
    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => {
                debug!("Connection {} closing for shutdown", connection_id);
                let _ = sender.send(Message::Close(None)).await;
                break;
            }

            _ = closing.cancelled() => {
                debug!("Connection {} closed by server", connection_id);
                let _ = sender.send(Message::Close(None)).await;
                break;
            }

            // 1. Pub/sub path
            result = room_rx.recv() => match result {
                Ok(envelope) => {
                    if recent.insert(envelope.event_id)
                        && send_frame(&mut sender, &ServerMessage::Event(envelope)).await.is_err()
                    {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Connection {} lagged, {} event(s) skipped on pub/sub path", connection_id, skipped);
                }
                Err(RecvError::Closed) => {
                    info!("Room {} channel closed, dropping connection {}", room_id, connection_id);
                    break;
                }
            },

            // 2. Direct path
            Some(outbound) = direct_rx.recv() => {
                let frame = match outbound {
                    Outbound::Event(envelope) => {
                        if !recent.insert(envelope.event_id) {
                            continue;
                        }
                        ServerMessage::Event(envelope)
                    }
                    Outbound::Redeliver(envelope) => {
                        recent.insert(envelope.event_id);
                        ServerMessage::Event(envelope)
                    }
                    Outbound::Frame(frame) => frame,
                };
                if send_frame(&mut sender, &frame).await.is_err() {
                    break;
                }
            }

            // 3. Client frames
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    ctx.broadcaster.registry().touch(connection_id, ctx.clock.now_secs());
                    if let Some(reply) = handle_client_text(&ctx, room_id, user_id, connection_id, &text) {
                        if send_frame(&mut sender, &reply).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {
                    // Ping/pong/binary still count as liveness
                    ctx.broadcaster.registry().touch(connection_id, ctx.clock.now_secs());
                }
                Some(Err(e)) => {
                    debug!("Connection {} socket error: {}", connection_id, e);
                    break;
                }
            },
        }
    }

    disconnect(&ctx, connection_id);
}

/// Handle one text frame; returns an optional reply for this connection
fn handle_client_text(
    ctx: &AppContext,
    room_id: Uuid,
    user_id: Uuid,
    connection_id: Uuid,
    text: &str,
) -> Option<ServerMessage> {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            debug!("Connection {} sent unparseable frame: {}", connection_id, e);
            return Some(ServerMessage::Error {
                message: format!("Invalid message: {}", e),
            });
        }
    };

    match message {
        ClientMessage::Confirm { event_id } => {
            ctx.broadcaster.confirm(event_id, connection_id);
            None
        }
        ClientMessage::Ping { client_time } => Some(ServerMessage::Pong {
            client_time,
            server_time: ctx.clock.now_secs(),
        }),
        ClientMessage::Vote { track_id, value } => {
            match ctx.queue.record_vote(room_id, track_id, user_id, value) {
                Some(votes) => {
                    let event = RoomEvent::TrackVoted {
                        track_id,
                        user_id,
                        votes,
                    };
                    if let Err(e) = ctx.broadcaster.publish_default(room_id, event) {
                        warn!("Room {}: vote not broadcast: {}", room_id, e);
                    }
                    None
                }
                None => Some(ServerMessage::Error {
                    message: format!("Track {} is not queued in room {}", track_id, room_id),
                }),
            }
        }
    }
}

fn announce_arrival(ctx: &AppContext, room_id: Uuid, user_id: Uuid, is_administrator: bool) {
    let event = RoomEvent::UserJoined {
        user_id,
        is_administrator,
    };
    if let Err(e) = ctx.broadcaster.publish_default(room_id, event) {
        warn!("Failed to announce arrival of {}: {}", user_id, e);
    }
    if is_administrator {
        if let Err(e) = ctx.broadcaster.publish_room_update(room_id) {
            warn!("Failed to publish room update for {}: {}", room_id, e);
        }
    }
}

/// Unregister and announce departure (no-op if cleanup got there first)
fn disconnect(ctx: &AppContext, connection_id: Uuid) {
    if let Some(handle) = ctx.broadcaster.registry().unregister(connection_id) {
        info!("Connection {} closed (user {})", connection_id, handle.user_id);
        announce_departure(&ctx.broadcaster, &handle);
    }
}

async fn send_frame(sender: &mut SocketSender, frame: &ServerMessage) -> std::result::Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(json) => json,
        Err(e) => {
            // Serialization failures drop the frame, not the connection
            warn!("Failed to serialize frame: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(json)).await.map_err(|e| {
        debug!("Socket send failed: {}", e);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_events_dedup_and_eviction() {
        let mut recent = RecentEvents::new(2);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        assert!(recent.insert(a));
        assert!(!recent.insert(a));
        assert!(recent.insert(b));
        assert!(recent.insert(c));
        // `a` evicted once capacity exceeded
        assert!(recent.insert(a));
        assert!(!recent.insert(c));
    }
}
