//! Configuration management for connection migration
//!
//! Settings can be loaded from a TOML or JSON file, or from `QUICPATH_*`
//! environment variables on top of the defaults.

use crate::quic::error::{QuicError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;

/// Largest connection ID length allowed by QUIC v1
const MAX_SCID_LEN: usize = 20;

/// Local alternate CID pool capacity
const MAX_ALT_CONNECTION_IDS: usize = 8;

/// Upper bound on `path_validation_timeout_ms` (10 minutes)
pub const MAX_PATH_VALIDATION_TIMEOUT_MS: u64 = 600_000;

/// Upper bound on `secret_rotation_secs` (30 days)
pub const MAX_SECRET_ROTATION_SECS: u64 = 30 * 24 * 3600;

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path migration and connection ID settings
    pub migration: MigrationConfig,
    /// Stateless retry settings
    pub retry: RetryConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Path migration and connection ID configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Length of locally issued connection IDs
    pub scid_len: usize,
    /// Number of alternate connection IDs offered to the peer
    pub num_alt_connection_ids: usize,
    /// How many peer-issued connection IDs we are willing to store
    pub active_connection_id_limit: u64,
    /// Time allowed for a new path to validate, in milliseconds
    pub path_validation_timeout_ms: u64,
    /// Address advertised in the preferred_address transport parameter (servers)
    pub preferred_address: Option<SocketAddr>,
    /// Close the connection on undecodable frame bytes instead of dropping them
    pub reject_trailing_garbage: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            scid_len: 8,
            num_alt_connection_ids: MAX_ALT_CONNECTION_IDS,
            active_connection_id_limit: 8,
            path_validation_timeout_ms: 3_000, // 3 seconds
            preferred_address: None,
            reject_trailing_garbage: false,
        }
    }
}

/// Stateless retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Send Retry packets to unvalidated clients
    pub enabled: bool,
    /// Cookie secret rotation interval in seconds, 0 to never rotate
    pub secret_rotation_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            secret_rotation_secs: 3_600, // 1 hour
        }
    }
}

impl RetryConfig {
    pub fn rotation_interval(&self) -> Option<Duration> {
        (self.secret_rotation_secs > 0).then(|| Duration::from_secs(self.secret_rotation_secs))
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl LoggingConfig {
    /// Get tracing level
    pub fn tracing_level(&self) -> Level {
        match self.level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| QuicError::Config(format!("Failed to read config file: {}", e)))?;
        Self::parse(&contents)
    }

    fn parse(contents: &str) -> Result<Self> {
        // Try different formats
        if let Ok(config) = toml::from_str::<Self>(contents) {
            return Ok(config);
        }

        if let Ok(config) = serde_json::from_str::<Self>(contents) {
            return Ok(config);
        }

        Err(QuicError::Config("Unsupported config format".to_string()))
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P, format: ConfigFormat) -> Result<()> {
        let contents = match format {
            ConfigFormat::Toml => toml::to_string_pretty(self)
                .map_err(|e| QuicError::Config(format!("Failed to serialize to TOML: {}", e)))?,
            ConfigFormat::Json => serde_json::to_string_pretty(self)
                .map_err(|e| QuicError::Config(format!("Failed to serialize to JSON: {}", e)))?,
        };

        std::fs::write(path, contents)
            .map_err(|e| QuicError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        // Migration config
        if let Some(val) = var("QUICPATH_SCID_LEN") {
            config.migration.scid_len = parse_var("QUICPATH_SCID_LEN", &val)?;
        }

        if let Some(val) = var("QUICPATH_NUM_ALT_CONNECTION_IDS") {
            config.migration.num_alt_connection_ids = parse_var("QUICPATH_NUM_ALT_CONNECTION_IDS", &val)?;
        }

        if let Some(val) = var("QUICPATH_ACTIVE_CONNECTION_ID_LIMIT") {
            config.migration.active_connection_id_limit = parse_var("QUICPATH_ACTIVE_CONNECTION_ID_LIMIT", &val)?;
        }

        if let Some(val) = var("QUICPATH_PATH_VALIDATION_TIMEOUT_MS") {
            config.migration.path_validation_timeout_ms = parse_var("QUICPATH_PATH_VALIDATION_TIMEOUT_MS", &val)?;
        }

        if let Some(val) = var("QUICPATH_PREFERRED_ADDRESS") {
            config.migration.preferred_address = Some(parse_var("QUICPATH_PREFERRED_ADDRESS", &val)?);
        }

        if let Some(val) = var("QUICPATH_REJECT_TRAILING_GARBAGE") {
            config.migration.reject_trailing_garbage = parse_var("QUICPATH_REJECT_TRAILING_GARBAGE", &val)?;
        }

        // Retry config
        if let Some(val) = var("QUICPATH_RETRY_ENABLED") {
            config.retry.enabled = parse_var("QUICPATH_RETRY_ENABLED", &val)?;
        }

        if let Some(val) = var("QUICPATH_RETRY_SECRET_ROTATION_SECS") {
            config.retry.secret_rotation_secs = parse_var("QUICPATH_RETRY_SECRET_ROTATION_SECS", &val)?;
        }

        // Logging config
        if let Some(val) = var("QUICPATH_LOG_LEVEL") {
            config.logging.level = val;
        }

        if let Some(val) = var("QUICPATH_LOG_FORMAT") {
            config.logging.format = match val.to_lowercase().as_str() {
                "text" => LogFormat::Text,
                "json" => LogFormat::Json,
                other => return Err(QuicError::Config(format!("Invalid QUICPATH_LOG_FORMAT: {}", other))),
            };
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let migration = &self.migration;

        if migration.scid_len == 0 || migration.scid_len > MAX_SCID_LEN {
            return Err(QuicError::Config(format!(
                "scid_len must be between 1 and {}",
                MAX_SCID_LEN
            )));
        }

        if migration.num_alt_connection_ids > MAX_ALT_CONNECTION_IDS {
            return Err(QuicError::Config(format!(
                "num_alt_connection_ids must be at most {}",
                MAX_ALT_CONNECTION_IDS
            )));
        }

        if migration.active_connection_id_limit < 2 {
            return Err(QuicError::Config("active_connection_id_limit must be at least 2".to_string()));
        }

        if migration.path_validation_timeout_ms == 0 {
            return Err(QuicError::Config("path_validation_timeout_ms must be greater than 0".to_string()));
        }

        if migration.path_validation_timeout_ms > MAX_PATH_VALIDATION_TIMEOUT_MS {
            return Err(QuicError::Config(format!(
                "path_validation_timeout_ms must be at most {}",
                MAX_PATH_VALIDATION_TIMEOUT_MS
            )));
        }

        if self.retry.secret_rotation_secs > MAX_SECRET_ROTATION_SECS {
            return Err(QuicError::Config(format!(
                "secret_rotation_secs must be at most {}",
                MAX_SECRET_ROTATION_SECS
            )));
        }

        Ok(())
    }

    /// Get duration values
    pub fn path_validation_timeout(&self) -> Duration {
        Duration::from_millis(self.migration.path_validation_timeout_ms)
    }

    /// Get tracing level
    pub fn tracing_level(&self) -> Level {
        self.logging.tracing_level()
    }
}

fn parse_var<T>(name: &str, val: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    val.parse()
        .map_err(|e| QuicError::Config(format!("Invalid {}: {}", name, e)))
}

/// Configuration file format
#[derive(Debug, Clone, Copy)]
pub enum ConfigFormat {
    Toml,
    Json,
}

/// Configuration builder for easier setup
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn scid_len(mut self, len: usize) -> Self {
        self.config.migration.scid_len = len;
        self
    }

    pub fn num_alt_connection_ids(mut self, count: usize) -> Self {
        self.config.migration.num_alt_connection_ids = count;
        self
    }

    pub fn path_validation_timeout(mut self, timeout: Duration) -> Self {
        self.config.migration.path_validation_timeout_ms =
            u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Advertise a preferred address to clients
    pub fn preferred_address(mut self, addr: SocketAddr) -> Self {
        self.config.migration.preferred_address = Some(addr);
        self
    }

    pub fn reject_trailing_garbage(mut self) -> Self {
        self.config.migration.reject_trailing_garbage = true;
        self
    }

    /// Enable stateless retry
    pub fn enable_retry(mut self) -> Self {
        self.config.retry.enabled = true;
        self
    }

    /// Set log level
    pub fn log_level<S: Into<String>>(mut self, level: S) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.path_validation_timeout(), Duration::from_secs(3));
        assert_eq!(config.tracing_level(), Level::INFO);
        assert_eq!(config.retry.rotation_interval(), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .scid_len(16)
            .num_alt_connection_ids(4)
            .preferred_address("192.0.2.1:443".parse().unwrap())
            .enable_retry()
            .log_level("debug")
            .build()
            .unwrap();

        assert_eq!(config.migration.scid_len, 16);
        assert_eq!(config.migration.num_alt_connection_ids, 4);
        assert_eq!(config.migration.preferred_address.unwrap().port(), 443);
        assert!(config.retry.enabled);
        assert_eq!(config.tracing_level(), Level::DEBUG);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.migration.scid_len = 21;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.migration.num_alt_connection_ids = 9;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.migration.active_connection_id_limit = 1;
        assert!(config.validate().is_err());

        assert!(ConfigBuilder::new()
            .path_validation_timeout(Duration::ZERO)
            .build()
            .is_err());

        let mut config = Config::default();
        config.migration.path_validation_timeout_ms = MAX_PATH_VALIDATION_TIMEOUT_MS + 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retry.secret_rotation_secs = u64::MAX;
        assert!(config.validate().is_err());
        config.retry.secret_rotation_secs = MAX_SECRET_ROTATION_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = Config::parse(
            r#"
            [migration]
            scid_len = 12
            preferred_address = "192.0.2.1:443"

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.migration.scid_len, 12);
        assert_eq!(config.migration.num_alt_connection_ids, 8);
        assert!(config.migration.preferred_address.is_some());
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_json() {
        let config = Config::parse(r#"{"retry": {"enabled": true, "secret_rotation_secs": 0}}"#).unwrap();
        assert!(config.retry.enabled);
        assert_eq!(config.retry.rotation_interval(), None);
    }

    #[test]
    fn test_parse_garbage() {
        assert!(Config::parse("[migration\nscid_len = ").is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let path = std::env::temp_dir().join(format!("quicpath-config-{}.toml", std::process::id()));
        let config = ConfigBuilder::new().scid_len(4).reject_trailing_garbage().build().unwrap();

        config.save_to_file(&path, ConfigFormat::Toml).unwrap();
        let loaded = Config::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("QUICPATH_SCID_LEN", "4"),
            ("QUICPATH_RETRY_ENABLED", "true"),
            ("QUICPATH_LOG_FORMAT", "JSON"),
            ("QUICPATH_PREFERRED_ADDRESS", "[2001:db8::1]:443"),
        ]
        .into_iter()
        .collect();

        let config = Config::from_vars(|name| vars.get(name).map(|v| v.to_string())).unwrap();
        assert_eq!(config.migration.scid_len, 4);
        assert!(config.retry.enabled);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.migration.preferred_address.unwrap().is_ipv6());

        let bad = Config::from_vars(|name| (name == "QUICPATH_SCID_LEN").then(|| "eight".to_string()));
        assert!(bad.is_err());
    }
}
