//! Configuration for tandem-client
//!
//! Settings priority:
//! 1. Command-line arguments (--server, --room, --user)
//! 2. Environment variables (TANDEM_CLIENT_SERVER, TANDEM_CLIENT_CONFIG)
//! 3. TOML configuration file
//! 4. Built-in defaults (code constants)

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tandem_common::config::{load_toml_or_default, LoggingConfig};

use crate::error::{Error, Result};

/// Client configuration loaded from TOML
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the room server (http:// or https://)
    #[serde(default = "default_server_url")]
    pub server_url: String,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub connection: ConnectionSettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            logging: LoggingConfig::default(),
            sync: SyncSettings::default(),
            connection: ConnectionSettings::default(),
        }
    }
}

impl ClientConfig {
    /// Load from `path`, falling back to defaults if the file is absent
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Self = load_toml_or_default(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would break the sync or reconnect math
    pub fn validate(&self) -> Result<()> {
        if !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "server_url must start with http:// or https://, got {}",
                self.server_url
            )));
        }
        if self.sync.samples == 0 {
            return Err(Error::Config("sync.samples must be at least 1".to_string()));
        }
        if self.sync.history_size == 0 {
            return Err(Error::Config("sync.history_size must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.connection.latency_ema_alpha) {
            return Err(Error::Config(
                "connection.latency_ema_alpha must be within [0, 1]".to_string(),
            ));
        }
        if self.connection.queue_capacity == 0 {
            return Err(Error::Config("connection.queue_capacity must be at least 1".to_string()));
        }
        if !self.connection.jitter_ratio.is_finite() || self.connection.jitter_ratio < 0.0 {
            return Err(Error::Config(
                "connection.jitter_ratio must be a non-negative number".to_string(),
            ));
        }
        // Zero periods panic in tokio's interval and stall the backoff
        for (name, value) in [
            ("sync.normal_interval_ms", self.sync.normal_interval_ms),
            ("sync.high_latency_interval_ms", self.sync.high_latency_interval_ms),
            ("connection.ping_interval_ms", self.connection.ping_interval_ms),
            ("connection.backoff_base_ms", self.connection.backoff_base_ms),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than 0", name)));
            }
        }
        Ok(())
    }

    /// WebSocket URL for `room_id` as `user_id`
    pub fn socket_url(&self, room_id: uuid::Uuid, user_id: uuid::Uuid) -> String {
        let base = self.server_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}/api/v1/rooms/{}/ws?user_id={}", ws_base, room_id, user_id)
    }

    /// Server time endpoint URL
    pub fn time_url(&self) -> String {
        format!("{}/api/v1/time", self.server_url.trim_end_matches('/'))
    }
}

/// Clock sync and drift correction settings
#[derive(Debug, Clone, Deserialize)]
pub struct SyncSettings {
    /// Round trips per offset measurement
    #[serde(default = "default_samples")]
    pub samples: usize,

    /// Timeout of one server time request
    #[serde(default = "default_sample_timeout_ms")]
    pub sample_timeout_ms: u64,

    /// Tolerance floor (seconds)
    #[serde(default = "default_base_tolerance")]
    pub base_tolerance: f64,

    /// Cap of the latency term (seconds)
    #[serde(default = "default_max_latency_term")]
    pub max_latency_term: f64,

    /// Cap of the jitter term (seconds)
    #[serde(default = "default_max_jitter_term")]
    pub max_jitter_term: f64,

    /// Sync interval under normal latency
    #[serde(default = "default_normal_interval_ms")]
    pub normal_interval_ms: u64,

    /// Sync interval under high latency
    #[serde(default = "default_high_latency_interval_ms")]
    pub high_latency_interval_ms: u64,

    /// Latency at or above which the shorter interval applies
    #[serde(default = "default_high_latency_threshold_ms")]
    pub high_latency_threshold_ms: f64,

    /// Failures at which sync status becomes out of sync
    #[serde(default = "default_out_of_sync_threshold")]
    pub out_of_sync_threshold: u32,

    /// Failures at which force recovery is offered
    #[serde(default = "default_force_recovery_threshold")]
    pub force_recovery_threshold: u32,

    /// Failure count left after a force recovery
    #[serde(default = "default_recovered_failure_count")]
    pub recovered_failure_count: u32,

    /// Sync history ring buffer size
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    /// Recent entries inspected for sustained poor performance
    #[serde(default = "default_poor_window")]
    pub poor_window: usize,

    /// Out-of-tolerance entries within the window that count as sustained
    #[serde(default = "default_poor_threshold")]
    pub poor_threshold: usize,

    /// Tolerance added under sustained poor performance (seconds)
    #[serde(default = "default_poor_tolerance_bump")]
    pub poor_tolerance_bump: f64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            samples: default_samples(),
            sample_timeout_ms: default_sample_timeout_ms(),
            base_tolerance: default_base_tolerance(),
            max_latency_term: default_max_latency_term(),
            max_jitter_term: default_max_jitter_term(),
            normal_interval_ms: default_normal_interval_ms(),
            high_latency_interval_ms: default_high_latency_interval_ms(),
            high_latency_threshold_ms: default_high_latency_threshold_ms(),
            out_of_sync_threshold: default_out_of_sync_threshold(),
            force_recovery_threshold: default_force_recovery_threshold(),
            recovered_failure_count: default_recovered_failure_count(),
            history_size: default_history_size(),
            poor_window: default_poor_window(),
            poor_threshold: default_poor_threshold(),
            poor_tolerance_bump: default_poor_tolerance_bump(),
        }
    }
}

impl SyncSettings {
    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_timeout_ms)
    }

    /// Largest tolerance the formula can produce (seconds)
    pub fn max_tolerance(&self) -> f64 {
        self.base_tolerance + self.max_latency_term + self.max_jitter_term
    }
}

/// Connection resilience settings
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionSettings {
    /// First reconnect delay
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Reconnect delay ceiling
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Random extra delay as a fraction of the computed delay
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,

    /// Consecutive failed attempts before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Outbound queue bound while not connected
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Send attempts per queued message before it is dropped
    #[serde(default = "default_max_send_retries")]
    pub max_send_retries: u32,

    /// Consecutive connect failures that open the circuit breaker
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,

    /// How long the breaker stays open before half-opening
    #[serde(default = "default_breaker_cooldown_ms")]
    pub breaker_cooldown_ms: u64,

    /// Smoothing factor of the latency moving average
    #[serde(default = "default_latency_ema_alpha")]
    pub latency_ema_alpha: f64,

    /// Interval of latency probes while connected
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            jitter_ratio: default_jitter_ratio(),
            max_attempts: default_max_attempts(),
            queue_capacity: default_queue_capacity(),
            max_send_retries: default_max_send_retries(),
            breaker_threshold: default_breaker_threshold(),
            breaker_cooldown_ms: default_breaker_cooldown_ms(),
            latency_ema_alpha: default_latency_ema_alpha(),
            ping_interval_ms: default_ping_interval_ms(),
        }
    }
}

impl ConnectionSettings {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.breaker_cooldown_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}

fn default_server_url() -> String {
    "http://127.0.0.1:5780".to_string()
}

fn default_samples() -> usize {
    3
}

fn default_sample_timeout_ms() -> u64 {
    2000
}

fn default_base_tolerance() -> f64 {
    0.1
}

fn default_max_latency_term() -> f64 {
    0.4
}

fn default_max_jitter_term() -> f64 {
    0.2
}

fn default_normal_interval_ms() -> u64 {
    1000
}

fn default_high_latency_interval_ms() -> u64 {
    750
}

fn default_high_latency_threshold_ms() -> f64 {
    100.0
}

fn default_out_of_sync_threshold() -> u32 {
    3
}

fn default_force_recovery_threshold() -> u32 {
    5
}

fn default_recovered_failure_count() -> u32 {
    1
}

fn default_history_size() -> usize {
    100
}

fn default_poor_window() -> usize {
    10
}

fn default_poor_threshold() -> usize {
    5
}

fn default_poor_tolerance_bump() -> f64 {
    0.05
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_jitter_ratio() -> f64 {
    0.1
}

fn default_max_attempts() -> u32 {
    10
}

fn default_queue_capacity() -> usize {
    100
}

fn default_max_send_retries() -> u32 {
    3
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_cooldown_ms() -> u64 {
    30_000
}

fn default_latency_ema_alpha() -> f64 {
    0.2
}

fn default_ping_interval_ms() -> u64 {
    5000
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_defaults_match_sync_formula() {
        let config = ClientConfig::default();
        assert_eq!(config.sync.samples, 3);
        assert!((config.sync.max_tolerance() - 0.7).abs() < 1e-9);
        assert_eq!(config.connection.max_send_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: ClientConfig = toml::from_str(
            r#"
            server_url = "https://rooms.example.net/"

            [connection]
            max_attempts = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.connection.max_attempts, 4);
        assert_eq!(config.connection.backoff_base_ms, 1000);
        assert_eq!(config.sync.history_size, 100);
        assert_eq!(config.time_url(), "https://rooms.example.net/api/v1/time");
    }

    #[test]
    fn test_socket_url_switches_scheme() {
        let config = ClientConfig::default();
        let room = Uuid::nil();
        let user = Uuid::nil();
        assert_eq!(
            config.socket_url(room, user),
            format!("ws://127.0.0.1:5780/api/v1/rooms/{}/ws?user_id={}", room, user)
        );
    }

    #[test]
    fn test_load_from_file_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        std::fs::write(&path, "[sync]\nsamples = 5\n").unwrap();
        assert_eq!(ClientConfig::load(Some(&path)).unwrap().sync.samples, 5);

        let missing = dir.path().join("absent.toml");
        assert_eq!(ClientConfig::load(Some(&missing)).unwrap().sync.samples, 3);

        std::fs::write(&path, "[sync]\nsamples = 0\n").unwrap();
        assert!(ClientConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ClientConfig::default();
        config.server_url = "ftp://nope".to_string();
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.connection.latency_ema_alpha = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_periods_and_bad_jitter() {
        let mut config = ClientConfig::default();
        config.connection.ping_interval_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ping_interval_ms"), "{}", err);

        let mut config = ClientConfig::default();
        config.connection.backoff_base_ms = 0;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.sync.normal_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.sync.high_latency_interval_ms = 0;
        assert!(config.validate().is_err());

        for jitter in [-0.1, f64::NAN, f64::INFINITY] {
            let mut config = ClientConfig::default();
            config.connection.jitter_ratio = jitter;
            assert!(config.validate().is_err(), "jitter {} accepted", jitter);
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        std::fs::write(&path, "[connection]\nping_interval_ms = 0\n").unwrap();
        assert!(ClientConfig::load(Some(&path)).is_err());
    }
}
