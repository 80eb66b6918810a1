//! Tandem Room Server (tandem-server) - Main entry point
//!
//! Loads bootstrap configuration, seeds the in-memory room directory and
//! serves the playback API until Ctrl+C / SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tandem_common::config::resolve_config_path;
use tandem_common::SystemClock;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tandem_server::api::{self, AppContext};
use tandem_server::config::TomlConfig;
use tandem_server::playback::{InMemoryCatalog, Track};

/// Command-line arguments for tandem-server
#[derive(Parser, Debug)]
#[command(name = "tandem-server")]
#[command(about = "Synchronized room playback server")]
#[command(version)]
struct Args {
    /// Port to listen on (overrides config file)
    #[arg(short, long, env = "TANDEM_SERVER_PORT")]
    port: Option<u16>,

    /// Address to bind (overrides config file)
    #[arg(short, long, env = "TANDEM_SERVER_BIND")]
    bind: Option<String>,

    /// Path to TOML config file (else TANDEM_SERVER_CONFIG, else platform default)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = resolve_config_path(args.config.as_deref(), "TANDEM_SERVER_CONFIG", "tandem-server");
    let mut config = TomlConfig::load(config_path.as_deref())
        .context("Failed to load configuration")?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.filter_directive("tandem_server").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // CLI / env overrides
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }

    info!("Starting Tandem room server v{}", env!("CARGO_PKG_VERSION"));
    match &config_path {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: built-in defaults"),
    }

    // Seed the in-memory directory
    let catalog = Arc::new(InMemoryCatalog::new());
    for room in &config.rooms {
        catalog.add_room(room.id, room.administrator_id);
        for seed in &room.tracks {
            let mut track = Track::new(seed.id, seed.duration);
            if let Some(title) = &seed.title {
                track = track.with_title(title.clone());
            }
            catalog.enqueue_track(room.id, track);
        }
        info!(
            "Room {} seeded (administrator {}, {} track(s))",
            room.id,
            room.administrator_id,
            room.tracks.len()
        );
    }

    let ctx = AppContext::new(
        catalog.clone(),
        catalog,
        Arc::new(SystemClock),
        config.broadcast.clone(),
    );
    ctx.start_background_tasks(config.cleanup.clone());

    api::run(&config.bind_address, config.port, ctx)
        .await
        .context("Server error")?;

    Ok(())
}
