//! # Tandem Listening Client (tandem-client)
//!
//! Keeps a local audio engine on a room's authoritative timeline.
//!
//! **Purpose:** Measure the offset to the server clock, project the room
//! timeline to "now", correct local drift by jumping the engine, and keep
//! the room channel alive across network failures.
//!
//! **Architecture:** `sync` holds the clock estimator, position calculator
//! and drift corrector; `connection` the reconnecting WebSocket manager;
//! `session` wires them to an [`sync::AudioEngine`].

pub mod audio;
pub mod config;
pub mod connection;
pub mod error;
pub mod session;
pub mod sync;

pub use error::{Error, Result};
