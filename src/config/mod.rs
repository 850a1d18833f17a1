//! Configuration Module
//!
//! Provides TOML-based configuration for femtomq with support for:
//! - Logging level
//! - Server settings (bind address, poll interval, listen backlog)
//! - Connection and packet size limits
//! - PUBLISH fan-out policy
//! - Environment variable overrides (FEMTOMQ__* prefix)

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::broker::{BrokerConfig, FanoutMode, DEFAULT_MAX_QUEUED_MESSAGES};

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Server configuration
    pub server: ServerConfig,
    /// Connection limits
    pub limits: LimitsConfig,
    /// MQTT behaviour
    pub mqtt: MqttConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Longest wait for socket readiness in one loop cycle
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 1883))
}
fn default_poll_interval() -> Duration {
    Duration::from_millis(20)
}
fn default_backlog() -> u32 {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            poll_interval: default_poll_interval(),
            backlog: default_backlog(),
        }
    }
}

/// Connection limits configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum number of connections (0 = unbounded)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Maximum remaining length of an inbound packet in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// Maximum PUBLISH frames waiting in one connection's outbound queue (0 = unbounded)
    #[serde(default = "default_max_queued_messages")]
    pub max_queued_messages: usize,
}

fn default_max_connections() -> usize {
    10_000
}
fn default_max_packet_size() -> usize {
    1024 * 1024
}
fn default_max_queued_messages() -> usize {
    DEFAULT_MAX_QUEUED_MESSAGES
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_packet_size: default_max_packet_size(),
            max_queued_messages: default_max_queued_messages(),
        }
    }
}

/// MQTT behaviour configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// How a PUBLISH is copied to subscribers with several matching filters
    pub fanout: FanoutMode,
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `FEMTOMQ__` prefix with double underscores for nesting:
    ///    - `FEMTOMQ__SERVER__BIND=0.0.0.0:1884` overrides `server.bind`
    ///    - `FEMTOMQ__LIMITS__MAX_CONNECTIONS=500` overrides `limits.max_connections`
    ///    - `FEMTOMQ__MQTT__FANOUT=per_filter` overrides `mqtt.fanout`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("server.bind", "0.0.0.0:1883")?
            .set_default("server.poll_interval", "20ms")?
            .set_default("server.backlog", 256)?
            .set_default("limits.max_connections", 10_000)?
            .set_default("limits.max_packet_size", 1024 * 1024)?
            .set_default("limits.max_queued_messages", 1000)?
            .set_default("mqtt.fanout", "per_connection")?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("FEMTOMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // max_connections = 0 means unbounded
        if self.limits.max_packet_size == 0 {
            return Err(ConfigError::Validation(
                "limits.max_packet_size must be greater than 0".to_string(),
            ));
        }
        if self.server.poll_interval.is_zero() {
            return Err(ConfigError::Validation(
                "server.poll_interval must be greater than 0".to_string(),
            ));
        }
        if self.server.backlog == 0 {
            return Err(ConfigError::Validation(
                "server.backlog must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl From<&Config> for BrokerConfig {
    fn from(config: &Config) -> Self {
        Self {
            bind_addr: config.server.bind,
            poll_interval: config.server.poll_interval,
            backlog: config.server.backlog,
            max_connections: config.limits.max_connections,
            max_packet_size: config.limits.max_packet_size,
            max_queued_messages: config.limits.max_queued_messages,
            fanout: config.mqtt.fanout,
        }
    }
}
