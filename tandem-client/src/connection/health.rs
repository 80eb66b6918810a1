//! Connection health metrics and quality indicator

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Coarse connection quality shown to the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Offline,
}

impl fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionQuality::Excellent => write!(f, "excellent"),
            ConnectionQuality::Good => write!(f, "good"),
            ConnectionQuality::Fair => write!(f, "fair"),
            ConnectionQuality::Poor => write!(f, "poor"),
            ConnectionQuality::Offline => write!(f, "offline"),
        }
    }
}

/// Point-in-time copy of the health counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub successful_connections: u64,
    pub failed_connections: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_lost: u64,
    /// Exponential moving average of ping round trips
    pub average_latency_ms: Option<f64>,
    /// Share of the tracked lifetime spent connected (0-100)
    pub uptime_percent: f64,
    pub quality: ConnectionQuality,
}

/// Counters maintained by the connection manager
#[derive(Debug)]
pub struct HealthMetrics {
    alpha: f64,
    successful_connections: u64,
    failed_connections: u64,
    messages_sent: u64,
    messages_received: u64,
    messages_lost: u64,
    latency_ema: Option<f64>,
    created_at: Instant,
    connected_since: Option<Instant>,
    connected_total: Duration,
}

impl HealthMetrics {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            successful_connections: 0,
            failed_connections: 0,
            messages_sent: 0,
            messages_received: 0,
            messages_lost: 0,
            latency_ema: None,
            created_at: Instant::now(),
            connected_since: None,
            connected_total: Duration::ZERO,
        }
    }

    pub fn connection_succeeded(&mut self) {
        self.successful_connections += 1;
        if self.connected_since.is_none() {
            self.connected_since = Some(Instant::now());
        }
    }

    pub fn connection_failed(&mut self) {
        self.failed_connections += 1;
    }

    /// Connection dropped or closed
    pub fn connection_lost(&mut self) {
        if let Some(since) = self.connected_since.take() {
            self.connected_total += since.elapsed();
        }
    }

    pub fn message_sent(&mut self) {
        self.messages_sent += 1;
    }

    pub fn message_received(&mut self) {
        self.messages_received += 1;
    }

    pub fn message_lost(&mut self) {
        self.messages_lost += 1;
    }

    /// Fold a round-trip sample into the moving average
    pub fn record_latency(&mut self, rtt_ms: f64) {
        if !rtt_ms.is_finite() || rtt_ms < 0.0 {
            return;
        }
        self.latency_ema = Some(match self.latency_ema {
            Some(avg) => self.alpha * rtt_ms + (1.0 - self.alpha) * avg,
            None => rtt_ms,
        });
    }

    pub fn average_latency_ms(&self) -> Option<f64> {
        self.latency_ema
    }

    pub fn uptime_percent(&self) -> f64 {
        let lifetime = self.created_at.elapsed();
        if lifetime.is_zero() {
            return if self.connected_since.is_some() { 100.0 } else { 0.0 };
        }
        let mut connected = self.connected_total;
        if let Some(since) = self.connected_since {
            connected += since.elapsed();
        }
        (connected.as_secs_f64() / lifetime.as_secs_f64() * 100.0).min(100.0)
    }

    /// Quality from latency and message loss; Offline while not connected
    pub fn quality(&self) -> ConnectionQuality {
        if self.connected_since.is_none() {
            return ConnectionQuality::Offline;
        }
        let attempted = self.messages_sent + self.messages_lost;
        let loss = if attempted == 0 {
            0.0
        } else {
            self.messages_lost as f64 / attempted as f64
        };
        let latency = self.latency_ema.unwrap_or(0.0);

        if loss > 0.1 || latency >= 500.0 {
            ConnectionQuality::Poor
        } else if loss > 0.02 || latency >= 250.0 {
            ConnectionQuality::Fair
        } else if latency >= 100.0 {
            ConnectionQuality::Good
        } else {
            ConnectionQuality::Excellent
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            successful_connections: self.successful_connections,
            failed_connections: self.failed_connections,
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
            messages_lost: self.messages_lost,
            average_latency_ms: self.latency_ema,
            uptime_percent: self.uptime_percent(),
            quality: self.quality(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_ema() {
        let mut health = HealthMetrics::new(0.2);
        health.record_latency(100.0);
        assert_eq!(health.average_latency_ms(), Some(100.0));
        health.record_latency(200.0);
        assert!((health.average_latency_ms().unwrap() - 120.0).abs() < 1e-9);
        health.record_latency(f64::NAN);
        assert!((health.average_latency_ms().unwrap() - 120.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uptime_percentage() {
        let mut health = HealthMetrics::new(0.2);
        tokio::time::advance(Duration::from_secs(10)).await;
        health.connection_succeeded();
        tokio::time::advance(Duration::from_secs(30)).await;
        health.connection_lost();
        tokio::time::advance(Duration::from_secs(10)).await;

        assert!((health.uptime_percent() - 60.0).abs() < 1e-6);
        assert_eq!(health.quality(), ConnectionQuality::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quality_bands() {
        let mut health = HealthMetrics::new(1.0);
        health.connection_succeeded();
        health.record_latency(40.0);
        assert_eq!(health.quality(), ConnectionQuality::Excellent);
        health.record_latency(150.0);
        assert_eq!(health.quality(), ConnectionQuality::Good);
        health.record_latency(300.0);
        assert_eq!(health.quality(), ConnectionQuality::Fair);
        health.record_latency(40.0);
        for _ in 0..8 {
            health.message_sent();
        }
        health.message_lost();
        health.message_lost();
        assert_eq!(health.quality(), ConnectionQuality::Poor);
    }
}
