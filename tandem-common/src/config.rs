//! Configuration file resolution and TOML loading
//!
//! Configuration is layered, highest priority first:
//! 1. Command-line argument
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled defaults
//!
//! A missing config file is never fatal: the caller gets defaults and a
//! warning. A config file that exists but fails to parse is an error.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Logging configuration shared by both binaries
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full EnvFilter directive
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LoggingConfig {
    /// EnvFilter directive used when `RUST_LOG` is unset
    ///
    /// A bare level applies to `crate_name`, the shared crate and the HTTP
    /// trace layer; anything containing `=` or `,` is taken verbatim.
    pub fn filter_directive(&self, crate_name: &str) -> String {
        let level = self.level.trim();
        if level.contains('=') || level.contains(',') {
            return level.to_string();
        }
        format!(
            "{crate}={level},tandem_common={level},tower_http={level}",
            crate = crate_name,
            level = level
        )
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Platform config file location: `<config_dir>/tandem/<module>.toml`
pub fn default_config_path(module: &str) -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("tandem").join(format!("{}.toml", module)))
}

/// Pick the config file to load following the priority order above
///
/// Returns None when neither an explicit path nor an existing default file
/// is available.
pub fn resolve_config_path(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    module: &str,
) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: Platform default, only if it exists
    default_config_path(module).filter(|p| p.exists())
}

/// Load a TOML config, falling back to `T::default()` when the file is absent
pub fn load_toml_or_default<T>(path: Option<&Path>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let Some(path) = path else {
        info!("No config file found, using built-in defaults");
        return Ok(T::default());
    };

    if !path.exists() {
        warn!(
            "Config file {} not found, using built-in defaults",
            path.display()
        );
        return Ok(T::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config = toml::from_str::<T>(&content)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}
