/*!
 * Configuration management for zigdrive.
 *
 * Settings are layered: built-in defaults, then an optional file, then
 * environment variables (`ZIGDRIVE__ZONE__FALLBACK_WINDOW_MS=8000`).
 */
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Top-level configuration shared by every device runtime
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Security-zone enrollment configuration
    #[serde(default)]
    pub zone: ZoneConfig,

    /// Hub capability API configuration
    #[serde(default)]
    pub host: HostConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Application environment (development, production, etc.)
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter (trace, debug, info, warn, error or a full directive)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to include the event target in log lines
    #[serde(default = "default_with_target")]
    pub with_target: bool,
}

/// Security-zone enrollment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    /// How long the compliant enroll-request path gets before the fallback may run
    #[serde(default = "default_fallback_window_ms")]
    pub fallback_window_ms: u64,

    /// Deadline for the hub to acknowledge an enroll-response
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    /// Zone ID assigned in enroll-responses
    #[serde(default = "default_zone_id")]
    pub zone_id: u8,

    /// Clear a raised alarm after this delay (0 disables auto-reset)
    #[serde(default)]
    pub alarm_reset_ms: u64,
}

/// Hub capability API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Deadline for each capability add/remove/write call
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl ZoneConfig {
    /// Fallback window as a `Duration`
    pub fn fallback_window(&self) -> Duration {
        Duration::from_millis(self.fallback_window_ms)
    }

    /// Response deadline as a `Duration`
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Alarm auto-reset delay, if enabled
    pub fn alarm_reset(&self) -> Option<Duration> {
        (self.alarm_reset_ms > 0).then(|| Duration::from_millis(self.alarm_reset_ms))
    }
}

impl HostConfig {
    /// Host call deadline as a `Duration`
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            environment: default_environment(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: default_with_target(),
        }
    }
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            fallback_window_ms: default_fallback_window_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            zone_id: default_zone_id(),
            alarm_reset_ms: 0,
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

fn default_app_name() -> String {
    "zigdrive".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_with_target() -> bool {
    true
}

fn default_fallback_window_ms() -> u64 {
    5_000
}

fn default_response_timeout_ms() -> u64 {
    3_000
}

fn default_zone_id() -> u8 {
    10
}

fn default_call_timeout_ms() -> u64 {
    5_000
}

/// Layered configuration loader
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<PathBuf>,
    environment_prefix: Option<String>,
}

impl ConfigBuilder {
    /// Start from the built-in defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Layer an optional TOML/YAML/JSON file over the defaults
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Layer `PREFIX__SECTION__KEY` environment variables over the file
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Merge the layers and deserialize the result
    pub fn build(self) -> Result<Config> {
        let defaults = ConfigLib::try_from(&Config::default())
            .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?;
        let mut layers = ConfigLib::builder().add_source(defaults);

        if let Some(path) = &self.config_file {
            debug!("Layering configuration file {}", path.display());
            layers = layers.add_source(File::from(path.as_path()).required(false));
        }

        if let Some(prefix) = &self.environment_prefix {
            debug!("Layering environment variables with prefix {}", prefix);
            layers = layers.add_source(
                Environment::with_prefix(prefix)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config: Config = layers
            .build()
            .and_then(|merged| merged.try_deserialize())
            .map_err(|e| Error::config(format!("Failed to load configuration: {}", e)))?;

        info!(
            "Configuration loaded (fallback window {:?}, zone id {})",
            config.zone.fallback_window(),
            config.zone.zone_id
        );
        Ok(config)
    }
}
