//! Configuration Module
//!
//! TOML-based configuration for the bridge with support for:
//! - Local (telemetry) and remote (cloud) broker connections
//! - Cloud account login and token refresh schedule
//! - Device identity and control policy threshold
//! - Environment variable overrides (SOLARFLOW__* prefix)
//!
//! The configuration is loaded and validated once at startup; the result is
//! handed to the bridge explicitly.

use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use broker::BrokerConfig;
pub use cloud::{CloudConfig, ControlConfig, DeviceConfig, ShutdownConfig};

mod broker;
mod cloud;


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
    /// Local broker carrying grid-power telemetry
    pub local: BrokerConfig,
    /// Remote (cloud) broker fronting the storage device
    pub remote: BrokerConfig,
    /// Cloud web login
    pub cloud: CloudConfig,
    /// Controlled device
    pub device: DeviceConfig,
    /// Control policy
    pub control: ControlConfig,
    /// Shutdown sequencing
    pub shutdown: ShutdownConfig,
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

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `SOLARFLOW__` prefix with double underscores for nesting:
    ///    - `SOLARFLOW__LOCAL__HOST=10.0.0.2` overrides `local.host`
    ///    - `SOLARFLOW__CLOUD__PASSWORD=...` overrides `cloud.password`
    ///    - `SOLARFLOW__LOCAL__TOPICS=a/b,c/d` overrides `local.topics`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("local.port", 1883)?
            .set_default("remote.port", 1883)?
            .set_default("cloud.token_ttl", "5m")?
            .set_default("cloud.refresh_interval", "5m")?
            .set_default("cloud.request_timeout", "10s")?
            .set_default("control.threshold_watts", 300)?
            .set_default("shutdown.grace_period", "5s")?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Everything may come from the environment
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("SOLARFLOW")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("local.topics")
                    .with_list_parse_key("remote.topics")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Any error here keeps the bridge from starting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require(&self.local.host, "local.host")?;
        require(&self.remote.host, "remote.host")?;
        require(&self.cloud.username, "cloud.username")?;
        require(&self.cloud.password, "cloud.password")?;
        require(&self.cloud.token_url, "cloud.token_url")?;
        require(&self.device.product_id, "device.product_id")?;
        require(&self.device.device_id, "device.device_id")?;

        if self.local.topics.is_empty() {
            return Err(ConfigError::Validation(
                "local.topics must name at least one telemetry topic".to_string(),
            ));
        }

        if self.remote.password.is_some() {
            return Err(ConfigError::Validation(
                "remote.password is not used: the cloud access token is presented as the password"
                    .to_string(),
            ));
        }

        for (section, broker) in [("local", &self.local), ("remote", &self.remote)] {
            validate_broker(section, broker)?;
        }

        for id in [&self.device.product_id, &self.device.device_id] {
            if id.contains(&['/', '+', '#'][..]) {
                return Err(ConfigError::Validation(format!(
                    "device identifier '{}' must not contain '/', '+' or '#'",
                    id
                )));
            }
        }

        if self.cloud.token_ttl.is_zero() {
            return Err(ConfigError::Validation(
                "cloud.token_ttl must be greater than zero".to_string(),
            ));
        }
        if self.cloud.refresh_interval.is_zero() {
            return Err(ConfigError::Validation(
                "cloud.refresh_interval must be greater than zero".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.cloud.refresh_margin) {
            return Err(ConfigError::Validation(
                "cloud.refresh_margin must be in [0, 1)".to_string(),
            ));
        }

        Ok(())
    }
}

fn require(value: &str, key: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Validation(format!(
            "missing required key '{}'",
            key
        )));
    }
    Ok(())
}

fn validate_broker(section: &str, broker: &BrokerConfig) -> Result<(), ConfigError> {
    if broker.port == 0 {
        return Err(ConfigError::Validation(format!(
            "{}.port must be non-zero",
            section
        )));
    }
    if broker.subscribe_qos > 1 || broker.publish_qos > 1 {
        return Err(ConfigError::Validation(format!(
            "{}: only QoS 0 and 1 are supported",
            section
        )));
    }
    if broker.reconnect_interval == 0 || broker.connect_timeout == 0 {
        return Err(ConfigError::Validation(format!(
            "{}: reconnect_interval and connect_timeout must be greater than zero",
            section
        )));
    }
    if broker.max_reconnect_interval < broker.reconnect_interval {
        return Err(ConfigError::Validation(format!(
            "{}.max_reconnect_interval must not be below reconnect_interval",
            section
        )));
    }
    for topic in &broker.topics {
        crate::topic::validate_topic_filter(topic).map_err(|e| {
            ConfigError::Validation(format!("{}: invalid topic '{}': {}", section, topic, e))
        })?;
    }
    Ok(())
}
