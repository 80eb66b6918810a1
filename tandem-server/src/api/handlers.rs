//! HTTP request handlers
//!
//! Server time for client clock estimation, playback state, and the four
//! administrator-only playback controls.

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, State},
    http::request::Parts,
    Json,
};
use tandem_common::api::{
    HealthResponse, PlaybackStateResponse, ServerTimeResponse, StartPlaybackRequest,
    USER_ID_HEADER,
};
use tandem_common::time::to_iso8601;
use tracing::debug;
use uuid::Uuid;

use crate::api::server::AppContext;
use crate::error::{Error, Result};

// ============================================================================
// Caller identity
// ============================================================================

/// Caller's user id from the `x-user-id` header
///
/// Identity is issued by the external login layer; this extractor only
/// parses it. A missing or malformed header is rejected with 401.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerId(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for CallerId
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        let value = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| Error::Unauthenticated(format!("missing {} header", USER_ID_HEADER)))?;
        let text = value
            .to_str()
            .map_err(|_| Error::Unauthenticated(format!("non-ASCII {} header", USER_ID_HEADER)))?;
        let id = Uuid::parse_str(text.trim())
            .map_err(|e| Error::Unauthenticated(format!("invalid user id '{}': {}", text, e)))?;
        Ok(CallerId(id))
    }
}

// ============================================================================
// Health and time
// ============================================================================

/// GET /health - Health check endpoint
pub async fn health(State(ctx): State<AppContext>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        module: "tandem-server".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        rooms: ctx.directory.room_count(),
        connections: ctx.broadcaster.registry().count(),
    })
}

/// GET /api/v1/time - Authoritative server clock
///
/// Clients sample this repeatedly to estimate their clock offset.
pub async fn server_time(State(ctx): State<AppContext>) -> Json<ServerTimeResponse> {
    let now = ctx.clock.now_secs();
    Json(ServerTimeResponse {
        timestamp: to_iso8601(now),
        unix_timestamp: now,
    })
}

// ============================================================================
// Playback
// ============================================================================

/// GET /api/v1/rooms/:room_id/playback - Current playback state
pub async fn get_playback(
    State(ctx): State<AppContext>,
    Path(room_id): Path<Uuid>,
) -> Result<Json<PlaybackStateResponse>> {
    let playback_state = ctx.authority.state(room_id).await?;
    Ok(Json(PlaybackStateResponse { playback_state }))
}

/// POST /api/v1/rooms/:room_id/playback/start - Start a track from zero
pub async fn start(
    State(ctx): State<AppContext>,
    Path(room_id): Path<Uuid>,
    CallerId(caller): CallerId,
    Json(req): Json<StartPlaybackRequest>,
) -> Result<Json<PlaybackStateResponse>> {
    debug!("Start request: room {} track {} by {}", room_id, req.track_id, caller);
    let playback_state = ctx.authority.start(room_id, caller, req.track_id).await?;
    Ok(Json(PlaybackStateResponse { playback_state }))
}

/// POST /api/v1/rooms/:room_id/playback/pause - Pause playback
pub async fn pause(
    State(ctx): State<AppContext>,
    Path(room_id): Path<Uuid>,
    CallerId(caller): CallerId,
) -> Result<Json<PlaybackStateResponse>> {
    let playback_state = ctx.authority.pause(room_id, caller).await?;
    Ok(Json(PlaybackStateResponse { playback_state }))
}

/// POST /api/v1/rooms/:room_id/playback/resume - Resume playback
pub async fn resume(
    State(ctx): State<AppContext>,
    Path(room_id): Path<Uuid>,
    CallerId(caller): CallerId,
) -> Result<Json<PlaybackStateResponse>> {
    let playback_state = ctx.authority.resume(room_id, caller).await?;
    Ok(Json(PlaybackStateResponse { playback_state }))
}

/// POST /api/v1/rooms/:room_id/playback/skip - Skip to the next queued track
pub async fn skip(
    State(ctx): State<AppContext>,
    Path(room_id): Path<Uuid>,
    CallerId(caller): CallerId,
) -> Result<Json<PlaybackStateResponse>> {
    let playback_state = ctx.authority.skip(room_id, caller).await?;
    Ok(Json(PlaybackStateResponse { playback_state }))
}
