//! Tandem Listening Client (tandem-client) - Main entry point
//!
//! Headless listener: joins a room with a simulated audio engine and keeps
//! it in sync until Ctrl+C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tandem_common::config::resolve_config_path;
use tandem_common::MonotonicClock;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use tandem_client::audio::SimulatedAudioEngine;
use tandem_client::config::ClientConfig;
use tandem_client::connection::{ConnectionManager, WsConnector};
use tandem_client::session::RoomSession;
use tandem_client::sync::{ClockSyncEstimator, DriftCorrector, HttpTimeSource};

/// Command-line arguments for tandem-client
#[derive(Parser, Debug)]
#[command(name = "tandem-client")]
#[command(about = "Headless synchronized room listener")]
#[command(version)]
struct Args {
    /// Room to join
    #[arg(short, long, env = "TANDEM_CLIENT_ROOM")]
    room: Uuid,

    /// Listener identity (random if omitted)
    #[arg(short, long, env = "TANDEM_CLIENT_USER")]
    user: Option<Uuid>,

    /// Server base URL (overrides config file)
    #[arg(short, long, env = "TANDEM_CLIENT_SERVER")]
    server: Option<String>,

    /// Path to TOML config file (else TANDEM_CLIENT_CONFIG, else platform default)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Upvote a queued track once connected (repeatable)
    #[arg(long = "vote")]
    votes: Vec<Uuid>,

    /// Simulated playback speed error, e.g. 0.01 runs 1% fast
    #[arg(long, default_value_t = 0.0)]
    drift: f64,

    /// Run force recovery automatically when sync keeps failing
    #[arg(long)]
    auto_recover: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = resolve_config_path(args.config.as_deref(), "TANDEM_CLIENT_CONFIG", "tandem-client");
    let mut config = ClientConfig::load(config_path.as_deref())
        .context("Failed to load configuration")?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.filter_directive("tandem_client").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(server) = args.server {
        config.server_url = server;
        config.validate().context("Invalid --server")?;
    }
    let user_id = args.user.unwrap_or_else(Uuid::new_v4);

    info!("Starting Tandem client v{}", env!("CARGO_PKG_VERSION"));
    info!("Room {} as user {} via {}", args.room, user_id, config.server_url);

    let clock = Arc::new(MonotonicClock::new());
    let time_source = HttpTimeSource::new(config.time_url(), config.sync.sample_timeout())
        .context("Failed to build HTTP client")?;
    let estimator = ClockSyncEstimator::new(Arc::new(time_source), clock.clone(), config.sync.samples);
    let audio = Arc::new(SimulatedAudioEngine::with_drift(clock.clone(), args.drift));
    let corrector = Arc::new(DriftCorrector::new(
        estimator,
        audio,
        clock.clone(),
        config.sync.clone(),
    ));
    let connection = ConnectionManager::new(config.connection.clone(), clock);
    let session = RoomSession::new(connection, corrector).with_auto_recovery(args.auto_recover);

    for track_id in args.votes {
        session.vote(track_id, 1).context("Failed to queue vote")?;
    }

    let shutdown = session.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, leaving room"),
            Err(e) => {
                warn!("Cannot listen for Ctrl+C: {}", e);
                return;
            }
        }
        shutdown.cancel();
    });

    let connector = Arc::new(WsConnector::new(config.socket_url(args.room, user_id)));
    session.run(connector).await.context("Session failed")?;

    Ok(())
}
