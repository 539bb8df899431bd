//! Broker Connection Configuration
//!
//! Shared by the local (telemetry) and remote (cloud) broker sessions.

use std::time::Duration;

use serde::Deserialize;

use crate::protocol::QoS;

/// Connection settings for one broker session
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker host name or IP
    pub host: String,

    /// Broker TCP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Client ID; a per-process default is generated when unset
    pub client_id: Option<String>,

    /// Username for authentication
    pub username: Option<String>,

    /// Static password (local broker only; the cloud session presents the
    /// access token instead)
    pub password: Option<String>,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keepalive")]
    pub keepalive: u16,

    /// Reconnect interval in seconds
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: u64,

    /// Maximum reconnect interval in seconds (for exponential backoff)
    #[serde(default = "default_max_reconnect_interval")]
    pub max_reconnect_interval: u64,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Topic filters subscribed on every (re)connect
    #[serde(default)]
    pub topics: Vec<String>,

    /// QoS requested for subscriptions (0 or 1)
    #[serde(default)]
    pub subscribe_qos: u8,

    /// QoS used for outgoing publishes (0 or 1)
    #[serde(default = "default_publish_qos")]
    pub publish_qos: u8,

    /// How long a QoS 1 publish waits for its PUBACK
    #[serde(default = "default_publish_timeout", with = "humantime_serde")]
    pub publish_timeout: Duration,

    /// Largest packet accepted from the broker, in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

fn default_port() -> u16 {
    1883
}

fn default_keepalive() -> u16 {
    60
}

fn default_reconnect_interval() -> u64 {
    1
}

fn default_max_reconnect_interval() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_publish_qos() -> u8 {
    1
}

fn default_publish_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_packet_size() -> usize {
    crate::codec::DEFAULT_MAX_PACKET_SIZE
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            client_id: None,
            username: None,
            password: None,
            keepalive: default_keepalive(),
            reconnect_interval: default_reconnect_interval(),
            max_reconnect_interval: default_max_reconnect_interval(),
            connect_timeout: default_connect_timeout(),
            topics: Vec::new(),
            subscribe_qos: 0,
            publish_qos: default_publish_qos(),
            publish_timeout: default_publish_timeout(),
            max_packet_size: default_max_packet_size(),
        }
    }
}

impl BrokerConfig {
    /// Get the reconnect interval as Duration
    pub fn reconnect_interval_duration(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval)
    }

    /// Get the max reconnect interval as Duration
    pub fn max_reconnect_interval_duration(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_interval)
    }

    /// Get the connect timeout as Duration
    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// `host:port` for logging and connecting
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Configured client ID, or a stable per-process one tagged with `role`
    pub fn client_id_or_default(&self, role: &str) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("solarflow-bridge-{}-{}", role, std::process::id()))
    }

    pub fn subscribe_qos(&self) -> QoS {
        QoS::from_u8(self.subscribe_qos).unwrap_or_default()
    }

    pub fn publish_qos(&self) -> QoS {
        QoS::from_u8(self.publish_qos).unwrap_or(QoS::AtLeastOnce)
    }
}
