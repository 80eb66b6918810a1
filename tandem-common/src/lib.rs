//! # Tandem Common Library
//!
//! Shared code for the Tandem room server and listening clients:
//! - Event vocabulary (`RoomEvent`) and the wire envelope every event travels in
//! - HTTP/WebSocket request and response types
//! - Clock abstraction used for server timestamps and client offset measurement
//! - TOML configuration loading

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
pub use time::{Clock, ManualClock, MonotonicClock, SystemClock};
