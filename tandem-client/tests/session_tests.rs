//! End-to-end tests: a real tandem-server on a loopback port and a client
//! session with a simulated audio engine

use std::sync::Arc;
use std::time::Duration;
use tandem_client::audio::SimulatedAudioEngine;
use tandem_client::config::ClientConfig;
use tandem_client::connection::{ConnectionManager, ConnectionState, WsConnector};
use tandem_client::session::RoomSession;
use tandem_client::sync::{AudioEngine, ClockSyncEstimator, DriftCorrector, HttpTimeSource};
use tandem_common::ManualClock;
use tandem_server::api::{create_router, AppContext};
use tandem_server::config::BroadcastSettings;
use tandem_server::playback::{InMemoryCatalog, Track};
use uuid::Uuid;

struct Harness {
    ctx: AppContext,
    catalog: Arc<InMemoryCatalog>,
    config: ClientConfig,
    room_id: Uuid,
    admin: Uuid,
    tracks: Vec<Uuid>,
}

/// Server with one room and two queued tracks, clock frozen at t=1000
async fn start_server() -> Harness {
    let clock = Arc::new(ManualClock::new(1_000.0));
    let catalog = Arc::new(InMemoryCatalog::new());
    let room_id = Uuid::new_v4();
    let admin = Uuid::new_v4();
    catalog.add_room(room_id, admin);
    let tracks = (0..2)
        .map(|_| {
            let track = Track::new(Uuid::new_v4(), 240.0);
            let id = track.id;
            catalog.enqueue_track(room_id, track);
            id
        })
        .collect();

    let ctx = AppContext::new(
        catalog.clone(),
        catalog.clone(),
        clock,
        BroadcastSettings::default(),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_router(ctx.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let config = ClientConfig {
        server_url: format!("http://{}", addr),
        ..ClientConfig::default()
    };
    Harness {
        ctx,
        catalog,
        config,
        room_id,
        admin,
        tracks,
    }
}

fn client(harness: &Harness) -> (Arc<RoomSession>, Arc<SimulatedAudioEngine>) {
    // Client clock agrees with the server clock
    let clock = Arc::new(ManualClock::new(1_000.0));
    let source = HttpTimeSource::new(harness.config.time_url(), Duration::from_secs(2)).unwrap();
    let estimator = ClockSyncEstimator::new(Arc::new(source), clock.clone(), 3);
    let audio = Arc::new(SimulatedAudioEngine::new(clock.clone()));
    let corrector = Arc::new(DriftCorrector::new(
        estimator,
        audio.clone(),
        clock.clone(),
        harness.config.sync.clone(),
    ));
    let connection = ConnectionManager::new(harness.config.connection.clone(), clock);
    (Arc::new(RoomSession::new(connection, corrector)), audio)
}

/// Poll `check` every 20ms for up to 5s
async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..250 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_listener_follows_administrator_controls() {
    let harness = start_server().await;
    let (session, audio) = client(&harness);
    let user_id = Uuid::new_v4();

    // Vote queued before the socket exists
    session.vote(harness.tracks[1], 1).unwrap();

    let connector = Arc::new(WsConnector::new(
        harness.config.socket_url(harness.room_id, user_id),
    ));
    let running = session.clone();
    let task = tokio::spawn(async move { running.run(connector).await });

    assert!(eventually(|| session.connection().state() == ConnectionState::Connected).await);
    assert!(
        eventually(|| harness.catalog.queue_order(harness.room_id).first() == Some(&harness.tracks[1]))
            .await,
        "queued vote never reached the server"
    );

    harness
        .ctx
        .authority
        .start(harness.room_id, harness.admin, harness.tracks[0])
        .await
        .unwrap();
    assert!(eventually(|| audio.track_id() == Some(harness.tracks[0])).await);
    assert!(!audio.is_paused().await);
    assert!(audio.position().await.unwrap().abs() < 1e-6);

    // Every critical event (own UserJoined, PlaybackStarted) gets confirmed
    assert!(eventually(|| harness.ctx.broadcaster.pending_count() == 0).await);

    harness
        .ctx
        .authority
        .pause(harness.room_id, harness.admin)
        .await
        .unwrap();
    let mut paused = false;
    for _ in 0..250 {
        if audio.is_paused().await {
            paused = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(paused, "audio never paused");

    session.shutdown_token().cancel();
    task.await.unwrap().unwrap();
    assert_eq!(session.connection().state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_server_shutdown_closes_session_cleanly() {
    let harness = start_server().await;
    let (session, _audio) = client(&harness);

    let connector = Arc::new(WsConnector::new(
        harness.config.socket_url(harness.room_id, Uuid::new_v4()),
    ));
    let running = session.clone();
    let task = tokio::spawn(async move { running.run(connector).await });
    assert!(eventually(|| session.connection().state() == ConnectionState::Connected).await);

    harness.ctx.shutdown();
    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("session did not end")
        .unwrap();
    assert!(result.is_ok());
}
