//! Configuration Module
//!
//! TOML-based configuration for railbus with support for:
//! - Remote broker connection settings
//! - Failover budget and reachability hints
//! - Local broker sizing
//! - Environment variable overrides (RAILBUS__* prefix)

use std::path::Path;
use std::sync::OnceLock;

use config::{Environment, File, FileFormat};
use ipnet::IpNet;
use regex::Regex;
use serde::Deserialize;

pub use broker::{default_client_id, BrokerConfig, Endpoint, EndpointError, DEFAULT_MQTT_PORT};

use crate::failover::FailoverConfig;
use crate::local::LocalConfig;

mod broker;

#[cfg(test)]
mod tests;

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("env var pattern is valid")
    })
}

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    env_var_pattern()
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string()
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
    /// Remote broker connection
    pub broker: BrokerConfig,
    /// Failover behaviour
    pub failover: FailoverConfig,
    /// In-process broker
    pub local: LocalConfig,
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
    "warn".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `RAILBUS__` prefix with double underscores for nesting:
    ///    - `RAILBUS__BROKER__ENDPOINT=mqtt://broker:1883` overrides `broker.endpoint`
    ///    - `RAILBUS__BROKER__CONNECT_TIMEOUT=5s` overrides `broker.connect_timeout`
    ///    - `RAILBUS__FAILOVER__PREFER_LOCAL=true` overrides `failover.prefer_local`
    ///    - `RAILBUS__FAILOVER__UNREACHABLE_CIDRS=10.0.0.0/8,192.168.0.0/16`
    ///      sets the list of unreachable ranges
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", default_log_level())?
            .set_default("broker.endpoint", broker::default_endpoint())?
            .set_default("broker.vpn", broker::default_vpn())?
            .set_default("broker.client_id", default_client_id())?
            .set_default("broker.connect_timeout", "3s")?
            .set_default("broker.keep_alive", "30s")?
            .set_default("broker.reconnect_retries", 3)?
            .set_default("broker.reconnect_interval", "3s")?
            .set_default("failover.max_attempts", 1)?
            .set_default("failover.cooldown", "30s")?
            .set_default("failover.prefer_local", false)?
            .set_default("failover.loopback_unreachable", false)?
            .set_default("local.channel_capacity", 1024)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
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
                Environment::with_prefix("RAILBUS")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("failover.unreachable_cidrs")
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

    /// Parse configuration from a string (no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.log.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "log.level must be one of {}, got '{}'",
                LOG_LEVELS.join(", "),
                self.log.level
            )));
        }

        if let Err(e) = self.broker.parse_endpoint() {
            return Err(ConfigError::Validation(format!(
                "broker.endpoint '{}' is invalid: {}",
                self.broker.endpoint, e
            )));
        }

        if self.broker.client_id.is_empty() {
            return Err(ConfigError::Validation(
                "broker.client_id must not be empty".to_string(),
            ));
        }

        if self.broker.connect_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "broker.connect_timeout must be greater than zero".to_string(),
            ));
        }

        if self.broker.reconnect_retries > 0 && self.broker.reconnect_interval.is_zero() {
            return Err(ConfigError::Validation(
                "broker.reconnect_interval must be greater than zero when retries are enabled"
                    .to_string(),
            ));
        }

        if self.failover.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "failover.max_attempts must be at least 1".to_string(),
            ));
        }

        for cidr in &self.failover.unreachable_cidrs {
            if cidr.parse::<IpNet>().is_err() {
                return Err(ConfigError::Validation(format!(
                    "failover.unreachable_cidrs entry '{}' is not a valid CIDR",
                    cidr
                )));
            }
        }

        if self.local.channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "local.channel_capacity must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}
