//! Integration tests for the Tandem room server API
//!
//! Drives the router with `tower::ServiceExt::oneshot` and a manual clock so
//! timeline scenarios are deterministic. The WebSocket test runs a real
//! listener on an ephemeral port.

use axum::body::Body;
use axum::http::StatusCode;
use futures::{SinkExt, StreamExt};
use http::{Method, Request};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tandem_common::api::USER_ID_HEADER;
use tandem_common::events::{ClientMessage, RoomEvent, ServerMessage};
use tandem_common::ManualClock;
use tandem_server::api::{create_router, AppContext};
use tandem_server::config::BroadcastSettings;
use tandem_server::playback::{InMemoryCatalog, Track};
use tower::ServiceExt;
use uuid::Uuid;

struct TestRoom {
    app: axum::Router,
    ctx: AppContext,
    clock: Arc<ManualClock>,
    room_id: Uuid,
    admin: Uuid,
    tracks: Vec<Uuid>,
}

/// Room with `track_count` queued 180s tracks, clock at t=1000
fn setup(track_count: usize) -> TestRoom {
    let clock = Arc::new(ManualClock::new(1_000.0));
    let catalog = Arc::new(InMemoryCatalog::new());
    let room_id = Uuid::new_v4();
    let admin = Uuid::new_v4();
    catalog.add_room(room_id, admin);

    let tracks = (0..track_count)
        .map(|i| {
            let track = Track::new(Uuid::new_v4(), 180.0).with_title(format!("Track {}", i + 1));
            let id = track.id;
            catalog.enqueue_track(room_id, track);
            id
        })
        .collect();

    let ctx = AppContext::new(
        catalog.clone(),
        catalog,
        clock.clone(),
        BroadcastSettings::default(),
    );
    TestRoom {
        app: create_router(ctx.clone()),
        ctx,
        clock,
        room_id,
        admin,
        tracks,
    }
}

async fn request(
    app: &axum::Router,
    method: Method,
    path: &str,
    user: Option<Uuid>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(user) = user {
        builder = builder.header(USER_ID_HEADER, user.to_string());
    }
    let request = match body {
        Some(json_body) => builder
            .header("content-type", "application/json")
            .body(Body::from(json_body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json_body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json_body)
}

fn playback_path(room: &TestRoom, action: &str) -> String {
    format!("/api/v1/rooms/{}/playback/{}", room.room_id, action)
}

async fn start_first_track(room: &TestRoom) -> Value {
    let (status, body) = request(
        &room.app,
        Method::POST,
        &playback_path(room, "start"),
        Some(room.admin),
        Some(json!({ "track_id": room.tracks[0] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "start failed: {}", body);
    body
}

async fn current_position(room: &TestRoom) -> f64 {
    let path = format!("/api/v1/rooms/{}/playback", room.room_id);
    let (status, body) = request(&room.app, Method::GET, &path, None, None).await;
    assert_eq!(status, StatusCode::OK);
    body["playback_state"]["position"].as_f64().unwrap()
}

// ============================================================================
// Health and time
// ============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let room = setup(0);
    let (status, body) = request(&room.app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["module"], "tandem-server");
    assert_eq!(body["rooms"], 1);
    assert_eq!(body["connections"], 0);
}

#[tokio::test]
async fn test_server_time_endpoint() {
    let room = setup(0);
    let (status, body) = request(&room.app, Method::GET, "/api/v1/time", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["unix_timestamp"], 1_000.0);
    assert_eq!(body["timestamp"], "1970-01-01T00:16:40.000Z");
}

// ============================================================================
// Playback scenarios
// ============================================================================

#[tokio::test]
async fn test_start_then_position_after_five_seconds() {
    let room = setup(1);
    let body = start_first_track(&room).await;
    let state = &body["playback_state"];
    assert_eq!(state["is_playing"], true);
    assert_eq!(state["started_at"], 1_000.0);
    assert_eq!(state["server_time"], 1_000.0);
    assert_eq!(state["track_id"], room.tracks[0].to_string());

    room.clock.advance(5.0);
    assert!((current_position(&room).await - 5.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_pause_resume_preserves_elapsed_time() {
    let room = setup(1);
    start_first_track(&room).await;

    room.clock.advance(10.0);
    let (status, body) = request(&room.app, Method::POST, &playback_path(&room, "pause"), Some(room.admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["playback_state"]["paused_at"], 1_010.0);
    assert_eq!(body["playback_state"]["is_playing"], false);

    room.clock.advance(5.0);
    let (status, body) = request(&room.app, Method::POST, &playback_path(&room, "resume"), Some(room.admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["playback_state"]["started_at"], 1_005.0);
    assert!(body["playback_state"]["paused_at"].is_null());

    room.clock.advance(3.0);
    assert!((current_position(&room).await - 13.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_skip_with_empty_queue_stops_and_broadcasts() {
    let room = setup(1);
    start_first_track(&room).await;
    let mut events = room.ctx.broadcaster.subscribe(room.room_id);

    let (status, body) = request(&room.app, Method::POST, &playback_path(&room, "skip"), Some(room.admin), None).await;
    assert_eq!(status, StatusCode::OK);
    let state = &body["playback_state"];
    assert_eq!(state["is_playing"], false);
    assert!(state["track_id"].is_null());

    let envelope = events.recv().await.unwrap();
    assert_eq!(envelope.event_type, "TrackSkipped");
    match envelope.decode() {
        Some(RoomEvent::TrackSkipped {
            previous_track,
            next_track,
            ..
        }) => {
            assert_eq!(previous_track, Some(room.tracks[0]));
            assert!(next_track.is_none());
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(envelope.data["next_track"].is_null());
}

#[tokio::test]
async fn test_skip_advances_to_next_track() {
    let room = setup(2);
    start_first_track(&room).await;
    room.clock.advance(42.0);

    let (status, body) = request(&room.app, Method::POST, &playback_path(&room, "skip"), Some(room.admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["playback_state"]["track_id"], room.tracks[1].to_string());
    assert_eq!(body["playback_state"]["started_at"], 1_042.0);
    assert_eq!(body["playback_state"]["position"], 0.0);
}

#[tokio::test]
async fn test_non_administrator_pause_is_forbidden_and_state_unchanged() {
    let room = setup(1);
    start_first_track(&room).await;
    room.clock.advance(4.0);

    let path = format!("/api/v1/rooms/{}/playback", room.room_id);
    let (_, before) = request(&room.app, Method::GET, &path, None, None).await;

    let intruder = Uuid::new_v4();
    let (status, body) = request(&room.app, Method::POST, &playback_path(&room, "pause"), Some(intruder), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "authorization_error");
    assert!(body["message"].as_str().unwrap().contains("administrator"));

    let (_, after) = request(&room.app, Method::GET, &path, None, None).await;
    assert_eq!(before, after);
    assert_eq!(after["playback_state"]["is_playing"], true);
}

#[tokio::test]
async fn test_every_control_rejects_non_administrator() {
    let room = setup(1);
    let intruder = Some(Uuid::new_v4());
    for action in ["pause", "resume", "skip"] {
        let (status, _) = request(&room.app, Method::POST, &playback_path(&room, action), intruder, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN, "{} should be forbidden", action);
    }
    let (status, _) = request(
        &room.app,
        Method::POST,
        &playback_path(&room, "start"),
        intruder,
        Some(json!({ "track_id": room.tracks[0] })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

// ============================================================================
// Rejections
// ============================================================================

#[tokio::test]
async fn test_pause_while_stopped_is_conflict() {
    let room = setup(1);
    let (status, body) = request(&room.app, Method::POST, &playback_path(&room, "pause"), Some(room.admin), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "invalid_state_error");
}

#[tokio::test]
async fn test_resume_while_playing_is_conflict() {
    let room = setup(1);
    start_first_track(&room).await;
    let (status, _) = request(&room.app, Method::POST, &playback_path(&room, "resume"), Some(room.admin), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_missing_caller_header_is_unauthorized() {
    let room = setup(1);
    let (status, body) = request(&room.app, Method::POST, &playback_path(&room, "pause"), None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthenticated");
}

#[tokio::test]
async fn test_unknown_room_and_track_are_not_found() {
    let room = setup(1);
    let path = format!("/api/v1/rooms/{}/playback", Uuid::new_v4());
    let (status, _) = request(&room.app, Method::GET, &path, None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = request(
        &room.app,
        Method::POST,
        &playback_path(&room, "start"),
        Some(room.admin),
        Some(json!({ "track_id": Uuid::new_v4() })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// WebSocket channel
// ============================================================================

async fn next_frame<S>(ws: &mut S) -> ServerMessage
where
    S: futures::Stream<Item = Result<tokio_tungstenite::tungstenite::Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("socket error");
        if let tokio_tungstenite::tungstenite::Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn test_websocket_welcome_event_once_and_confirm() {
    let room = setup(1);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = room.app.clone();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let listener_id = Uuid::new_v4();
    let url = format!("ws://{}/api/v1/rooms/{}/ws?user_id={}", addr, room.room_id, listener_id);
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    match next_frame(&mut ws).await {
        ServerMessage::Welcome { playback_state, .. } => {
            assert_eq!(playback_state.room_id, room.room_id);
            assert!(!playback_state.is_playing);
        }
        other => panic!("expected welcome, got {:?}", other),
    }

    // Own UserJoined arrives first
    match next_frame(&mut ws).await {
        ServerMessage::Event(envelope) => assert_eq!(envelope.event_type, "UserJoined"),
        other => panic!("expected UserJoined, got {:?}", other),
    }

    room.ctx
        .authority
        .start(room.room_id, room.admin, room.tracks[0])
        .await
        .unwrap();

    let started = match next_frame(&mut ws).await {
        ServerMessage::Event(envelope) => envelope,
        other => panic!("expected event, got {:?}", other),
    };
    assert_eq!(started.event_type, "PlaybackStarted");
    assert_eq!(started.data["started_at"], 1_000.0);
    assert_eq!(
        room.ctx.broadcaster.confirmation_progress(started.event_id),
        Some((0, 1))
    );

    // Ping proves the duplicate from the second path was dropped
    let ping = serde_json::to_string(&ClientMessage::Ping { client_time: 7.0 }).unwrap();
    ws.send(tokio_tungstenite::tungstenite::Message::Text(ping)).await.unwrap();
    match next_frame(&mut ws).await {
        ServerMessage::Pong {
            client_time,
            server_time,
        } => {
            assert_eq!(client_time, 7.0);
            assert_eq!(server_time, 1_000.0);
        }
        other => panic!("expected pong (no duplicate event), got {:?}", other),
    }

    let confirm = serde_json::to_string(&ClientMessage::Confirm {
        event_id: started.event_id,
    })
    .unwrap();
    ws.send(tokio_tungstenite::tungstenite::Message::Text(confirm)).await.unwrap();

    let mut settled = false;
    for _ in 0..50 {
        if room.ctx.broadcaster.confirmation_progress(started.event_id).is_none() {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(settled, "confirmation never recorded");

    ws.close(None).await.unwrap();
}
