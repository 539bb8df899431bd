//! Cloud Account and Device Configuration

use std::time::Duration;

use serde::Deserialize;

/// Cloud web API login settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Account name used for the login exchange
    pub username: String,

    /// Account password
    pub password: String,

    /// Token endpoint, e.g. `https://app.zendure.tech/eu/auth/app/token`
    pub token_url: String,

    /// Device list endpoint (optional, used for a startup sanity check)
    pub device_list_url: Option<String>,

    /// App identifier sent in the login body
    #[serde(default = "default_app_id")]
    pub app_id: String,

    /// Lifetime assumed for a token when the server does not report one
    #[serde(default = "default_token_ttl", with = "humantime_serde")]
    pub token_ttl: Duration,

    /// Interval of the scheduled forced refresh
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,

    /// Fraction of the TTL treated as already expired
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin: f64,

    /// Timeout for each HTTP request
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

fn default_app_id() -> String {
    "121c83f761305d6cf7b".to_string()
}

fn default_token_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_refresh_margin() -> f64 {
    0.1
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            token_url: String::new(),
            device_list_url: None,
            app_id: default_app_id(),
            token_ttl: default_token_ttl(),
            refresh_interval: default_refresh_interval(),
            refresh_margin: default_refresh_margin(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// The storage device being controlled
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Product key of the device
    pub product_id: String,
    /// Device key
    pub device_id: String,
    /// Product name, used to pick input/output limit rules ("hyper", "ace")
    pub product_name: Option<String>,
}

/// Control policy settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Grid power above which the battery is charged, in watts
    #[serde(default = "default_threshold")]
    pub threshold_watts: i64,
}

fn default_threshold() -> i64 {
    300
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            threshold_watts: default_threshold(),
        }
    }
}

/// Shutdown sequencing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Upper bound on how long background tasks get to finish
    #[serde(default = "default_grace_period", with = "humantime_serde")]
    pub grace_period: Duration,
}

fn default_grace_period() -> Duration {
    Duration::from_secs(5)
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period: default_grace_period(),
        }
    }
}
