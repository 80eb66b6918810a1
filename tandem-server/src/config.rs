//! Configuration for tandem-server
//!
//! Bootstrap configuration is read once from TOML at startup. Settings
//! priority:
//! 1. Command-line arguments (--port, --bind)
//! 2. Environment variables (TANDEM_SERVER_PORT, TANDEM_SERVER_CONFIG)
//! 3. TOML configuration file
//! 4. Built-in defaults (code constants)
//!
//! The `[[rooms]]` tables seed the in-memory room directory so the binary can
//! run standalone; in production the directory is backed by the room CRUD
//! service.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tandem_common::config::{load_toml_or_default, LoggingConfig};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Bootstrap configuration loaded from TOML file
#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Address to bind
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Event broadcaster tuning
    #[serde(default)]
    pub broadcast: BroadcastSettings,

    /// Stale connection cleanup
    #[serde(default)]
    pub cleanup: CleanupSettings,

    /// Rooms known at startup
    #[serde(default)]
    pub rooms: Vec<SeedRoom>,
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            logging: LoggingConfig::default(),
            broadcast: BroadcastSettings::default(),
            cleanup: CleanupSettings::default(),
            rooms: Vec::new(),
        }
    }
}

impl TomlConfig {
    /// Load from `path`, falling back to defaults if the file is absent
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Self = load_toml_or_default(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would panic the broadcaster or cleanup timer
    pub fn validate(&self) -> Result<()> {
        if self.broadcast.channel_capacity == 0 {
            return Err(Error::Config(
                "broadcast.channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.cleanup.interval_ms == 0 {
            return Err(Error::Config(
                "cleanup.interval_ms must be greater than 0".to_string(),
            ));
        }
        for room in &self.rooms {
            if let Some(track) = room
                .tracks
                .iter()
                .find(|t| !t.duration.is_finite() || t.duration <= 0.0)
            {
                return Err(Error::Config(format!(
                    "track {} in room {} needs a positive duration",
                    track.id, room.id
                )));
            }
        }
        Ok(())
    }
}

/// Event broadcaster settings
#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastSettings {
    /// Per-room pub/sub channel capacity
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// How long to wait for critical-event confirmations
    #[serde(default = "default_confirmation_timeout_ms")]
    pub confirmation_timeout_ms: u64,

    /// Re-send once to subscribers that didn't confirm in time
    #[serde(default = "default_true")]
    pub retry_unconfirmed: bool,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            confirmation_timeout_ms: default_confirmation_timeout_ms(),
            retry_unconfirmed: true,
        }
    }
}

impl BroadcastSettings {
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }
}

/// Stale connection cleanup settings
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupSettings {
    /// How often the cleanup timer runs
    #[serde(default = "default_cleanup_interval_ms")]
    pub interval_ms: u64,

    /// Connections silent for longer than this are dropped
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_cleanup_interval_ms(),
            stale_after_ms: default_stale_after_ms(),
        }
    }
}

impl CleanupSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

/// Room seeded into the in-memory directory
#[derive(Debug, Clone, Deserialize)]
pub struct SeedRoom {
    pub id: Uuid,
    pub administrator_id: Uuid,
    /// Queue in initial order
    #[serde(default)]
    pub tracks: Vec<SeedTrack>,
}

/// Track seeded into a room's queue
#[derive(Debug, Clone, Deserialize)]
pub struct SeedTrack {
    pub id: Uuid,
    /// Duration in seconds
    pub duration: f64,
    #[serde(default)]
    pub title: Option<String>,
}

fn default_port() -> u16 {
    5780
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_channel_capacity() -> usize {
    100
}

fn default_confirmation_timeout_ms() -> u64 {
    5000
}

fn default_cleanup_interval_ms() -> u64 {
    30_000
}

fn default_stale_after_ms() -> u64 {
    90_000
}

fn default_true() -> bool {
    true
}
