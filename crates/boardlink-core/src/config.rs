/*!
 * Configuration management for Boardlink.
 *
 * This module provides functionality to load, validate, and access the
 * settings that govern transports, sessions, reconnection and telemetry.
 */
use std::path::Path;
use std::sync::Arc;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Core configuration for Boardlink
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Default transport timeouts
    #[serde(default)]
    pub transport: TransportSection,

    /// Session and probe timing
    #[serde(default)]
    pub session: SessionSection,

    /// Reconnection backoff policy
    #[serde(default)]
    pub reconnect: ReconnectSection,

    /// Heartbeat settings
    #[serde(default)]
    pub heartbeat: HeartbeatSection,

    /// Telemetry storage settings
    #[serde(default)]
    pub telemetry: TelemetrySection,
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
    /// Log level or filter directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to use JSON format for logs
    #[serde(default)]
    pub json_format: bool,

    /// Whether to include the event target in log lines
    #[serde(default = "default_true")]
    pub with_target: bool,
}

/// Default transport timeouts, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSection {
    /// Connect timeout
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Read timeout used by the session read loop per poll
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Write timeout
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

/// Session and probe timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    /// Bound on a single driver probe
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Bound on the open handshake
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,

    /// Default timeout for `invoke`
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Consecutive malformed frames that fault a session
    #[serde(default = "default_fault_threshold")]
    pub fault_threshold: u32,

    /// Maximum bytes requested from the transport per read
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,
}

/// Reconnection backoff policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSection {
    /// Delay before the first retry
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound on the retry delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Maximum random jitter added to each delay
    #[serde(default)]
    pub jitter_ms: u64,

    /// Consecutive failures before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// Heartbeat settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSection {
    /// Whether the supervisor runs a heartbeat
    #[serde(default)]
    pub enabled: bool,

    /// Interval between heartbeats
    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,

    /// Endpoint invoked as heartbeat
    #[serde(default = "default_heartbeat_endpoint")]
    pub endpoint: String,

    /// Timeout of a single heartbeat invoke
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub timeout_ms: u64,

    /// Consecutive failures that count as a disconnect
    #[serde(default = "default_heartbeat_max_missed")]
    pub max_missed: u32,
}

/// Telemetry storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySection {
    /// Requested ring-buffer capacity (rounded up to a power of two >= 2000)
    #[serde(default = "default_telemetry_capacity")]
    pub capacity: usize,
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
            json_format: false,
            with_target: true,
        }
    }
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout_ms(),
            open_timeout_ms: default_open_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            fault_threshold: default_fault_threshold(),
            read_chunk: default_read_chunk(),
        }
    }
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: 0,
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: default_heartbeat_interval_ms(),
            endpoint: default_heartbeat_endpoint(),
            timeout_ms: default_heartbeat_timeout_ms(),
            max_missed: default_heartbeat_max_missed(),
        }
    }
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            capacity: default_telemetry_capacity(),
        }
    }
}

fn default_app_name() -> String {
    "boardlink".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout_ms() -> u64 {
    3_000
}

fn default_read_timeout_ms() -> u64 {
    100
}

fn default_write_timeout_ms() -> u64 {
    1_000
}

fn default_probe_timeout_ms() -> u64 {
    1_500
}

fn default_open_timeout_ms() -> u64 {
    5_000
}

fn default_command_timeout_ms() -> u64 {
    2_000
}

fn default_fault_threshold() -> u32 {
    2
}

fn default_read_chunk() -> usize {
    512
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    3_200
}

fn default_max_attempts() -> u32 {
    10
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_heartbeat_endpoint() -> String {
    "ping".to_string()
}

fn default_heartbeat_timeout_ms() -> u64 {
    1_000
}

fn default_heartbeat_max_missed() -> u32 {
    3
}

fn default_telemetry_capacity() -> usize {
    4096
}

impl Config {
    /// Check cross-field constraints that serde defaults cannot express
    pub fn validate(&self) -> Result<()> {
        if self.reconnect.initial_delay_ms == 0 {
            return Err(Error::config("reconnect.initial_delay_ms must be greater than zero"));
        }
        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err(Error::config(
                "reconnect.max_delay_ms must not be smaller than reconnect.initial_delay_ms",
            ));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(Error::config("reconnect.max_attempts must be at least 1"));
        }
        if self.session.fault_threshold == 0 {
            return Err(Error::config("session.fault_threshold must be at least 1"));
        }
        if self.session.read_chunk == 0 {
            return Err(Error::config("session.read_chunk must be greater than zero"));
        }
        if self.heartbeat.enabled && self.heartbeat.endpoint.is_empty() {
            return Err(Error::config("heartbeat.endpoint must be set when the heartbeat is enabled"));
        }
        Ok(())
    }
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<Config> {
        let mut config_builder = ConfigLib::builder();

        let default_config = Config::default();
        config_builder = config_builder.add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.app_name, "boardlink");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.reconnect.initial_delay_ms, 100);
        assert_eq!(config.reconnect.max_delay_ms, 3_200);
        assert_eq!(config.session.fault_threshold, 2);
        assert!(!config.heartbeat.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config.general.app_name, "boardlink");
        assert_eq!(config.telemetry.capacity, 4096);
    }

    #[test]
    fn test_config_builder_with_file() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("boardlink.toml");

        {
            let mut file = File::create(&file_path)?;
            file.write_all(
                br#"
                [logging]
                level = "debug"

                [reconnect]
                initial_delay_ms = 250
                max_delay_ms = 8000
                max_attempts = 4

                [heartbeat]
                enabled = true
                endpoint = "status"
            "#,
            )?;
        }

        let config = ConfigBuilder::new().with_config_file(file_path).build()?;

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.reconnect.initial_delay_ms, 250);
        assert_eq!(config.reconnect.max_delay_ms, 8000);
        assert_eq!(config.reconnect.max_attempts, 4);
        assert!(config.heartbeat.enabled);
        assert_eq!(config.heartbeat.endpoint, "status");
        // Untouched sections keep their defaults
        assert_eq!(config.session.open_timeout_ms, 5_000);

        Ok(())
    }

    #[test]
    fn test_config_builder_rejects_inverted_backoff() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("bad.toml");
        std::fs::write(
            &file_path,
            "[reconnect]\ninitial_delay_ms = 500\nmax_delay_ms = 100\n",
        )?;

        let result = ConfigBuilder::new().with_config_file(file_path).build();
        assert!(matches!(result, Err(Error::Config(_))));
        Ok(())
    }

    #[test]
    fn test_config_builder_with_env() -> Result<()> {
        env::set_var("BOARDLINKTEST__SESSION__COMMAND_TIMEOUT_MS", "750");
        env::set_var("BOARDLINKTEST__LOGGING__LEVEL", "trace");

        let config = ConfigBuilder::new()
            .with_environment_prefix("boardlinktest")
            .build()?;

        assert_eq!(config.session.command_timeout_ms, 750);
        assert_eq!(config.logging.level, "trace");

        env::remove_var("BOARDLINKTEST__SESSION__COMMAND_TIMEOUT_MS");
        env::remove_var("BOARDLINKTEST__LOGGING__LEVEL");

        Ok(())
    }

    #[test]
    fn test_shared_config() {
        let shared = SharedConfig::new(Config::default());
        let shared2 = shared.clone();
        assert_eq!(shared2.get().general.app_name, "boardlink");
        assert_eq!(shared.as_ref().session.read_chunk, 512);
    }
}
