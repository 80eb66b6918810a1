//! Timestamp utilities and the clock abstraction
//!
//! Every timestamp that crosses the wire is epoch seconds as `f64`.
//! Components take an `Arc<dyn Clock>` so tests can drive time by hand.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Mutex;
use std::time::Instant;

/// Source of wall-clock time in epoch seconds
pub trait Clock: Send + Sync + 'static {
    /// Current time as seconds since the UNIX epoch
    fn now_secs(&self) -> f64;

    /// Current time as milliseconds since the UNIX epoch
    fn now_millis(&self) -> f64 {
        self.now_secs() * 1000.0
    }
}

/// Wall clock backed by `chrono::Utc::now()`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> f64 {
        to_epoch_secs(Utc::now())
    }
}

/// Wall clock anchored once and advanced by `Instant`
///
/// Immune to wall-clock steps (NTP adjustments) after construction, which
/// keeps round-trip measurements from going negative.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    anchor_secs: f64,
    anchor: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            anchor_secs: to_epoch_secs(Utc::now()),
            anchor: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_secs(&self) -> f64 {
        self.anchor_secs + self.anchor.elapsed().as_secs_f64()
    }
}

/// Hand-driven clock for tests and simulations
#[derive(Debug)]
pub struct ManualClock {
    secs: Mutex<f64>,
}

impl ManualClock {
    pub fn new(start_secs: f64) -> Self {
        Self {
            secs: Mutex::new(start_secs),
        }
    }

    /// Move time forward by `secs` seconds
    pub fn advance(&self, secs: f64) {
        let mut guard = self.secs.lock().unwrap_or_else(|e| e.into_inner());
        *guard += secs;
    }

    /// Jump to an absolute epoch time
    pub fn set(&self, secs: f64) {
        let mut guard = self.secs.lock().unwrap_or_else(|e| e.into_inner());
        *guard = secs;
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> f64 {
        *self.secs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Convert a chrono timestamp to epoch seconds
pub fn to_epoch_secs(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_micros() as f64 / 1_000_000.0
}

/// Convert epoch seconds to a chrono timestamp (None if out of range)
pub fn from_epoch_secs(secs: f64) -> Option<DateTime<Utc>> {
    let micros = (secs * 1_000_000.0).round() as i64;
    Utc.timestamp_micros(micros).single()
}

/// Format epoch seconds as RFC 3339 / ISO-8601 with millisecond precision
pub fn to_iso8601(secs: f64) -> String {
    from_epoch_secs(secs)
        .map(|ts| ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .unwrap_or_default()
}
