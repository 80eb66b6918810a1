//! Server-Sent Events mirror of a room channel
//!
//! Read-only listeners (dashboards, debugging) can follow a room without a
//! WebSocket. SSE subscribers are not registered connections: they never
//! confirm events and aren't counted as listeners.

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::server::AppContext;
use crate::error::Result;

/// GET /api/v1/rooms/:room_id/events - SSE event stream
pub async fn event_stream(
    State(ctx): State<AppContext>,
    Path(room_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    // Unknown rooms are rejected up front
    ctx.authority.state(room_id).await?;
    debug!("New SSE client for room {}", room_id);

    let rx = ctx.broadcaster.subscribe(room_id);
    let stream = BroadcastStream::new(rx).filter_map(|result| async move {
        match result {
            Ok(envelope) => match serde_json::to_string(&envelope) {
                Ok(json) => Some(Ok(Event::default()
                    .event(envelope.event_type.clone())
                    .id(envelope.event_id.to_string())
                    .data(json))),
                Err(e) => {
                    warn!("Failed to serialize event: {}", e);
                    None
                }
            },
            Err(e) => {
                // Lagged receiver; the missed events are gone
                warn!("SSE stream error: {:?}", e);
                None
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}
