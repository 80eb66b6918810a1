//! # Tandem Room Server (tandem-server)
//!
//! Authoritative playback timeline for shared listening rooms.
//!
//! **Purpose:** Accept administrator playback controls, keep each room's
//! canonical timeline, and fan out timestamped events to every listener over
//! WebSocket (with an SSE mirror).
//!
//! **Architecture:** `playback` owns room state behind per-room locks,
//! `broadcast` delivers events over pub/sub and direct paths with
//! confirmation tracking, `api` is the axum surface.

pub mod api;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod playback;

pub use error::{Error, Result};
