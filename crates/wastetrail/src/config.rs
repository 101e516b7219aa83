//! Configuration management for wastetrail.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::handoff::MIN_TOKEN_BYTES;
use crate::location::DEFAULT_MIN_FIX_INTERVAL_SECS;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "wastetrail";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "custody.db";

/// Environment variable prefix. Nested keys are separated by `__`,
/// e.g. `WASTETRAIL_TRACKING__MIN_FIX_INTERVAL_SECS`.
const ENV_PREFIX: &str = "WASTETRAIL_";

/// Default pattern for ad-hoc receiver phone numbers: optional `+`, then
/// 7 to 15 digits.
pub const DEFAULT_PHONE_PATTERN: &str = r"^\+?[0-9]{7,15}$";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `WASTETRAIL_`)
/// 2. TOML config file at `~/.config/wastetrail/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Location tracking configuration.
    pub tracking: TrackingConfig,
    /// Handoff configuration.
    pub handoff: HandoffConfig,
}

/// Storage-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the database file.
    /// Defaults to `~/.local/share/wastetrail/custody.db`
    pub database_path: Option<PathBuf>,
    /// How long a write waits on a locked database before failing with
    /// `Unavailable`.
    pub busy_timeout_ms: u64,
}

/// Location tracking configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Minimum wall-clock seconds between accepted fixes per session.
    pub min_fix_interval_secs: u64,
}

/// Handoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffConfig {
    /// Random bytes per confirmation token.
    pub token_bytes: usize,
    /// Regex a contact receiver's phone number must match.
    pub phone_pattern: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: None, // Will be resolved to default at runtime
            busy_timeout_ms: 5_000,
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            min_fix_interval_secs: DEFAULT_MIN_FIX_INTERVAL_SECS,
        }
    }
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            token_bytes: 32,
            phone_pattern: DEFAULT_PHONE_PATTERN.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading, parsing, or validation
    /// fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);
        Self::from_figment(Self::figment(&config_file))
    }

    fn figment(config_file: &std::path::Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.tracking.min_fix_interval_secs == 0 {
            return Err(Error::ConfigValidation {
                message: "min_fix_interval_secs must be greater than 0".to_string(),
            });
        }

        if self.handoff.token_bytes < MIN_TOKEN_BYTES {
            return Err(Error::ConfigValidation {
                message: format!(
                    "token_bytes ({}) must be at least {MIN_TOKEN_BYTES}",
                    self.handoff.token_bytes
                ),
            });
        }

        if regex::Regex::new(&self.handoff.phone_pattern).is_err() {
            return Err(Error::ConfigValidation {
                message: format!("invalid regex pattern: {}", self.handoff.phone_pattern),
            });
        }

        Ok(())
    }

    /// Get the database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    /// Get the busy timeout as a Duration.
    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.storage.busy_timeout_ms)
    }

    /// Get the fix throttle interval as a Duration.
    #[must_use]
    pub fn min_fix_interval(&self) -> Duration {
        Duration::from_secs(self.tracking.min_fix_interval_secs)
    }
}
