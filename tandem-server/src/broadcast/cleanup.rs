//! Stale connection cleanup
//!
//! A periodic timer drops connections that have sent nothing (not even a
//! ping) within `stale_after`, so half-open sockets don't keep expecting
//! confirmations or inflate listener counts.

use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::broadcaster::EventBroadcaster;
use super::registry::ConnectionHandle;
use crate::config::CleanupSettings;
use tandem_common::events::RoomEvent;
use tandem_common::Clock;

/// Drop every stale connection once; returns how many were removed
pub fn sweep_stale(
    broadcaster: &EventBroadcaster,
    clock: &dyn Clock,
    settings: &CleanupSettings,
) -> usize {
    let now = clock.now_secs();
    let stale_after = settings.stale_after().as_secs_f64();
    let stale = broadcaster.registry().stale(now, stale_after);

    let mut removed = 0;
    for handle in stale {
        // Another path (socket close) may have unregistered it already
        if broadcaster.registry().unregister(handle.connection_id).is_none() {
            continue;
        }
        removed += 1;
        info!(
            "Dropping stale connection {} (user {}, silent {:.0}s)",
            handle.connection_id,
            handle.user_id,
            now - handle.last_seen_secs()
        );
        handle.close();
        announce_departure(broadcaster, &handle);
    }
    removed
}

/// Publish `UserLeft` (and a presence update for administrators)
pub fn announce_departure(broadcaster: &EventBroadcaster, handle: &ConnectionHandle) {
    let Some(room_id) = handle.room_id else {
        return;
    };
    let event = RoomEvent::UserLeft {
        user_id: handle.user_id,
    };
    if let Err(e) = broadcaster.publish_default(room_id, event) {
        warn!("Failed to announce departure of {}: {}", handle.user_id, e);
    }
    if handle.is_administrator {
        if let Err(e) = broadcaster.publish_room_update(room_id) {
            warn!("Failed to publish room update for {}: {}", room_id, e);
        }
    }
}

/// Spawn the cleanup timer; stops when `shutdown` is cancelled
pub fn spawn_cleanup_task(
    broadcaster: EventBroadcaster,
    clock: Arc<dyn Clock>,
    settings: CleanupSettings,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(settings.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Connection cleanup stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let removed = sweep_stale(&broadcaster, clock.as_ref(), &settings);
                    if removed > 0 {
                        debug!("Cleanup removed {} stale connection(s)", removed);
                    }
                }
            }
        }
    })
}
