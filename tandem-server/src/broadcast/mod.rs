//! Room event broadcasting
//!
//! Per-room pub/sub channels, the live connection registry, confirmation
//! tracking for critical events, and stale connection cleanup.

pub mod broadcaster;
pub mod cleanup;
pub mod registry;

pub use broadcaster::{BroadcastStatsSnapshot, EventBroadcaster, PublishReceipt};
pub use cleanup::{announce_departure, spawn_cleanup_task, sweep_stale};
pub use registry::{ConnectionHandle, ConnectionRegistry, Outbound};
