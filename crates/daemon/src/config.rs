//! Configuration management for the Lockbox daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/lockbox/config.toml`.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::Framing;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::accounts::{is_valid_username, CredentialScheme};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("bind_address must be an IP address, got {0}")]
    InvalidBindAddress(String),

    #[error("accept_poll_ms must be between 10 and 60000, got {0}")]
    InvalidAcceptPoll(u64),

    #[error("drain_timeout_secs must be greater than 0 when set")]
    InvalidDrainTimeout,

    #[error("admin_user is not a valid username: {0:?}")]
    InvalidAdminUser(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Default port the server listens on.
pub const DEFAULT_PORT: u16 = 6666;

/// Default quota granted to new accounts (10 MiB).
pub const DEFAULT_QUOTA: u64 = 10 * 1024 * 1024;

/// Main configuration structure for the Lockbox daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Listener configuration.
    pub network: NetworkConfig,

    /// Per-user storage configuration.
    pub storage: StorageConfig,

    /// Security settings.
    pub security: SecurityConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory holding the account registry and, by default, user data.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for per-target log files. Console only when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind the listener to.
    pub bind_address: String,

    /// TCP port to listen on.
    pub port: u16,

    /// How often the acceptor checks for shutdown, in milliseconds.
    pub accept_poll_ms: u64,

    /// After shutdown starts, how long idle sessions may linger before they
    /// are asked to close. Sessions are never forced when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drain_timeout_secs: Option<u64>,

    /// Message framing expected from clients.
    pub framing: Framing,
}

/// Per-user storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Parent of every user's directory. Defaults to `<data_dir>/users_data`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub users_dir: Option<PathBuf>,

    /// Upload allowance in bytes granted to new accounts.
    pub default_quota: u64,
}

/// Security settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    /// Account allowed to stop the server remotely.
    pub admin_user: String,

    /// How new credentials are stored.
    pub credential_scheme: CredentialScheme,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            accept_poll_ms: 1000,
            drain_timeout_secs: None,
            framing: Framing::Auto,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            users_dir: None,
            default_quota: DEFAULT_QUOTA,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            admin_user: "admin".to_string(),
            credential_scheme: CredentialScheme::SaltedSha256,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lockbox")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lockbox")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - LOCKBOX_PORT: Override the listening port
    /// - LOCKBOX_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - LOCKBOX_DATA_DIR: Override the data directory
    pub fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("LOCKBOX_PORT") {
            if !port.is_empty() {
                match port.parse::<u16>() {
                    Ok(port) => {
                        tracing::info!("Overriding port from environment: {}", port);
                        self.network.port = port;
                    }
                    Err(_) => {
                        tracing::warn!("Ignoring invalid LOCKBOX_PORT value: {:?}", port);
                    }
                }
            }
        }

        if let Ok(level) = std::env::var("LOCKBOX_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(dir) = std::env::var("LOCKBOX_DATA_DIR") {
            if !dir.is_empty() {
                tracing::info!("Overriding data_dir from environment: {}", dir);
                self.daemon.data_dir = PathBuf::from(dir);
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        if self.network.bind_address.parse::<IpAddr>().is_err() {
            return Err(ConfigError::InvalidBindAddress(
                self.network.bind_address.clone(),
            ));
        }

        // Validate accept_poll_ms: 10-60000
        if !(10..=60_000).contains(&self.network.accept_poll_ms) {
            return Err(ConfigError::InvalidAcceptPoll(self.network.accept_poll_ms));
        }

        if self.network.drain_timeout_secs == Some(0) {
            return Err(ConfigError::InvalidDrainTimeout);
        }

        if !is_valid_username(&self.security.admin_user) {
            return Err(ConfigError::InvalidAdminUser(
                self.security.admin_user.clone(),
            ));
        }

        Ok(())
    }

    /// Directory containing every user's data.
    pub fn users_dir(&self) -> PathBuf {
        self.storage
            .users_dir
            .clone()
            .unwrap_or_else(|| self.daemon.data_dir.join("users_data"))
    }

    /// Path of the persisted account registry.
    pub fn registry_path(&self) -> PathBuf {
        self.daemon.data_dir.join("users.json")
    }

    /// `host:port` string for the listener.
    pub fn listen_addr(&self) -> String {
        match self.network.bind_address.parse::<IpAddr>() {
            Ok(IpAddr::V6(addr)) => format!("[{}]:{}", addr, self.network.port),
            _ => format!("{}:{}", self.network.bind_address, self.network.port),
        }
    }

    /// Interval at which the acceptor checks for shutdown.
    pub fn accept_poll(&self) -> Duration {
        Duration::from_millis(self.network.accept_poll_ms)
    }

    /// Grace period before idle sessions are asked to close, if any.
    pub fn drain_timeout(&self) -> Option<Duration> {
        self.network.drain_timeout_secs.map(Duration::from_secs)
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    ///
    /// The default path is `~/.config/lockbox/config.toml`.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
