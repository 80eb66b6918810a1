//! HTTP server setup and routing
//!
//! Sets up the axum router for the time endpoint, playback control, the
//! room WebSocket channel and the SSE mirror.

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tandem_common::Clock;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::broadcast::{spawn_cleanup_task, ConnectionRegistry, EventBroadcaster};
use crate::config::{BroadcastSettings, CleanupSettings};
use crate::error::{Error, Result};
use crate::playback::{PlaybackAuthority, RoomDirectory, TrackQueue};

/// Shared application context passed to all handlers
///
/// Cloning is cheap (everything is behind `Arc`), which gives axum
/// `FromRef<AppContext>` for free.
#[derive(Clone)]
pub struct AppContext {
    pub authority: Arc<PlaybackAuthority>,
    pub broadcaster: EventBroadcaster,
    pub directory: Arc<dyn RoomDirectory>,
    pub queue: Arc<dyn TrackQueue>,
    pub clock: Arc<dyn Clock>,
    /// Cancelled on shutdown; WebSocket tasks and timers observe it
    pub shutdown: CancellationToken,
}

impl AppContext {
    /// Wire the authority, broadcaster and registry together
    pub fn new(
        directory: Arc<dyn RoomDirectory>,
        queue: Arc<dyn TrackQueue>,
        clock: Arc<dyn Clock>,
        settings: BroadcastSettings,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = EventBroadcaster::new(settings, registry, Arc::clone(&clock));
        let authority = Arc::new(PlaybackAuthority::new(
            Arc::clone(&directory),
            Arc::clone(&queue),
            broadcaster.clone(),
            Arc::clone(&clock),
        ));
        Self {
            authority,
            broadcaster,
            directory,
            queue,
            clock,
            shutdown: CancellationToken::new(),
        }
    }

    /// Start background timers (stale connection cleanup)
    pub fn start_background_tasks(&self, cleanup: CleanupSettings) {
        spawn_cleanup_task(
            self.broadcaster.clone(),
            Arc::clone(&self.clock),
            cleanup,
            self.shutdown.child_token(),
        );
    }

    /// Stop timers and ask connection tasks to close
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.broadcaster.shutdown();
    }
}

/// Build the router with all routes
pub fn create_router(ctx: AppContext) -> Router {
    Router::new()
        // Health check (no prefix)
        .route("/health", get(super::handlers::health))
        // API v1 routes
        .nest(
            "/api/v1",
            Router::new()
                // Server clock
                .route("/time", get(super::handlers::server_time))
                // Playback state and control
                .route("/rooms/:room_id/playback", get(super::handlers::get_playback))
                .route("/rooms/:room_id/playback/start", post(super::handlers::start))
                .route("/rooms/:room_id/playback/pause", post(super::handlers::pause))
                .route("/rooms/:room_id/playback/resume", post(super::handlers::resume))
                .route("/rooms/:room_id/playback/skip", post(super::handlers::skip))
                // Room event channel
                .route("/rooms/:room_id/ws", get(super::ws::room_socket))
                .route("/rooms/:room_id/events", get(super::sse::event_stream)),
        )
        .with_state(ctx)
        .layer(TraceLayer::new_for_http())
        // Enable CORS for browser clients
        .layer(CorsLayer::permissive())
}

/// Run the HTTP server until Ctrl+C / SIGTERM
pub async fn run(bind_address: &str, port: u16, ctx: AppContext) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", bind_address, port)
        .parse()
        .map_err(|e| Error::Config(format!("Invalid bind address {}:{}: {}", bind_address, port, e)))?;

    let app = create_router(ctx.clone());

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Http(format!("Failed to bind to {}: {}", addr, e)))?;

    let shutdown_ctx = ctx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_ctx.shutdown();
        })
        .await
        .map_err(|e| Error::Http(format!("Server error: {}", e)))?;

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
