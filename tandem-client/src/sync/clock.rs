//! Clock sync estimator
//!
//! Estimates the offset between the local clock and the server clock from a
//! few HTTP round trips: for each sample `rtt = t1 - t0` and
//! `offset = ts - (t0 + rtt / 2)`, so `server ≈ local + offset`. The sample
//! means give the offset and one-way latency; the RTT standard deviation is
//! the jitter estimate.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tandem_common::api::ServerTimeResponse;
use tandem_common::Clock;
use tracing::{debug, warn};

use crate::config::SyncSettings;
use crate::error::{Error, Result};

/// Source of authoritative server time
#[async_trait]
pub trait TimeSource: Send + Sync {
    /// Server time in epoch seconds
    async fn server_time(&self) -> Result<f64>;
}

/// `GET /api/v1/time` over reqwest
pub struct HttpTimeSource {
    client: reqwest::Client,
    url: String,
}

impl HttpTimeSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl TimeSource for HttpTimeSource {
    async fn server_time(&self) -> Result<f64> {
        let response: ServerTimeResponse = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.unix_timestamp)
    }
}

/// One request/response round trip (milliseconds)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSample {
    /// Local send time
    pub t0: f64,
    /// Server timestamp
    pub server: f64,
    /// Local receive time
    pub t1: f64,
}

impl ClockSample {
    pub fn rtt(&self) -> f64 {
        (self.t1 - self.t0).max(0.0)
    }

    pub fn offset(&self) -> f64 {
        self.server - (self.t0 + self.rtt() / 2.0)
    }
}

/// Aggregated measurement (milliseconds)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockEstimate {
    pub offset_ms: f64,
    /// Mean one-way latency (`rtt / 2`)
    pub latency_ms: f64,
    /// Standard deviation of the RTTs
    pub jitter_ms: f64,
    /// Samples that succeeded
    pub samples: usize,
}

impl ClockEstimate {
    /// Aggregate successful samples (None if there are none)
    pub fn from_samples(samples: &[ClockSample]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let n = samples.len() as f64;
        let offset_ms = samples.iter().map(ClockSample::offset).sum::<f64>() / n;
        let rtts: Vec<f64> = samples.iter().map(ClockSample::rtt).collect();
        let mean_rtt = rtts.iter().sum::<f64>() / n;
        let variance = rtts.iter().map(|r| (r - mean_rtt).powi(2)).sum::<f64>() / n;

        Some(Self {
            offset_ms,
            latency_ms: mean_rtt / 2.0,
            jitter_ms: variance.sqrt(),
            samples: samples.len(),
        })
    }
}

/// Tolerance in seconds for the given network conditions
///
/// `base + clamp(latency/1000, 0, max_latency) + clamp(jitter/1000, 0, max_jitter)`
pub fn adaptive_tolerance(settings: &SyncSettings, latency_ms: f64, jitter_ms: f64) -> f64 {
    let latency_term = clamp_term(latency_ms / 1000.0, settings.max_latency_term);
    let jitter_term = clamp_term(jitter_ms / 1000.0, settings.max_jitter_term);
    settings.base_tolerance + latency_term + jitter_term
}

fn clamp_term(value: f64, max: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.max(0.0).min(max.max(0.0))
}

/// Measures the local/server clock offset
pub struct ClockSyncEstimator {
    source: Arc<dyn TimeSource>,
    clock: Arc<dyn Clock>,
    samples: usize,
}

impl ClockSyncEstimator {
    /// `clock` should be monotonic so round trips never go negative
    pub fn new(source: Arc<dyn TimeSource>, clock: Arc<dyn Clock>, samples: usize) -> Self {
        Self {
            source,
            clock,
            samples: samples.max(1),
        }
    }

    /// Run the configured number of round trips
    ///
    /// Individual sample failures are skipped. Fails with
    /// `ClockMeasurement` only when every sample failed; callers fall back
    /// to offset 0.
    pub async fn calculate_offset(&self) -> Result<ClockEstimate> {
        let mut samples = Vec::with_capacity(self.samples);
        let mut last_error = None;

        for i in 0..self.samples {
            let t0 = self.clock.now_millis();
            match self.source.server_time().await {
                Ok(server_secs) => {
                    let t1 = self.clock.now_millis();
                    let sample = ClockSample {
                        t0,
                        server: server_secs * 1000.0,
                        t1,
                    };
                    debug!(
                        "Clock sample {}: rtt {:.1}ms, offset {:.1}ms",
                        i + 1,
                        sample.rtt(),
                        sample.offset()
                    );
                    samples.push(sample);
                }
                Err(e) => {
                    warn!("Clock sample {} failed: {}", i + 1, e);
                    last_error = Some(e);
                }
            }
        }

        ClockEstimate::from_samples(&samples).ok_or_else(|| {
            Error::ClockMeasurement(format!(
                "all {} samples failed (last: {})",
                self.samples,
                last_error.map_or_else(|| "unknown".to_string(), |e| e.to_string())
            ))
        })
    }
}
