//! Error types for tandem-client
//!
//! Clock and drift errors are recovered locally (fallback offset, failure
//! counter). Connection errors are retried with backoff and only surface as
//! `ConnectivityLost` once the attempt budget is spent.

use std::time::Duration;
use thiserror::Error;

/// Main error type for tandem-client
#[derive(Error, Debug)]
pub enum Error {
    /// Offset measurement failed (every sample)
    #[error("Clock measurement error: {0}")]
    ClockMeasurement(String),

    /// Drift correction failed (seek or position read)
    #[error("Sync drift error: {0}")]
    SyncDrift(String),

    /// Transport-level failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Circuit breaker is open; attempts are short-circuited
    #[error("Circuit breaker open, retry in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },

    /// Reconnect budget exhausted (terminal)
    #[error("Connectivity lost after {attempts} reconnect attempt(s)")]
    ConnectivityLost { attempts: u32 },

    /// Outbound message rejected
    #[error("Send error: {0}")]
    Send(String),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket protocol errors
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Errors from shared code (config loading)
    #[error(transparent)]
    Common(#[from] tandem_common::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Other errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience Result type using tandem-client Error
pub type Result<T> = std::result::Result<T, Error>;
