//! Broker Session
//!
//! One self-healing MQTT client connection per broker. A session owns its
//! socket, its subscription set and a delivery task that hands incoming
//! messages to a typed [`MessageHandler`] one at a time, in receipt order.
//!
//! On connection loss the session reconnects with the same identity,
//! re-issues every subscription and only then reports itself connected.

mod client;
mod framed;


pub use client::BrokerSession;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::BrokerConfig;
use crate::protocol::{ConnectReturnCode, QoS};

/// Default capacity of the inbound delivery queue
pub const DEFAULT_INBOUND_CAPACITY: usize = 256;

/// Error type for session operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The session is not currently connected
    NotConnected,
    /// Connection to the broker failed or was lost
    ConnectionLost(String),
    /// Broker refused the CONNECT
    Rejected(ConnectReturnCode),
    /// Broker refused one or more subscriptions
    SubscribeRejected(Vec<String>),
    /// Operation timed out
    Timeout,
    /// The connection credential could not be obtained
    Credential(String),
    /// Broker sent something this client cannot handle
    Protocol(String),
    /// The session has been closed
    Closed,
    /// A background task of the session failed
    Task(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NotConnected => write!(f, "Not connected"),
            SessionError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            SessionError::Rejected(code) => write!(f, "Connection refused: {}", code),
            SessionError::SubscribeRejected(filters) => {
                write!(f, "Subscription refused for {}", filters.join(", "))
            }
            SessionError::Timeout => write!(f, "Operation timed out"),
            SessionError::Credential(msg) => write!(f, "Credential unavailable: {}", msg),
            SessionError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            SessionError::Closed => write!(f, "Session closed"),
            SessionError::Task(msg) => write!(f, "Session task failed: {}", msg),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::ConnectionLost(e.to_string())
    }
}

/// Status of a session connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Not connected, will attempt to connect
    Disconnected,
    /// Currently connecting (TCP, CONNECT, re-subscribe)
    Connecting,
    /// Connected and subscribed
    Connected,
    /// Connection failed, backing off before retry
    Backoff,
    /// Closed for good
    Closed,
}

/// Connection lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Connected and all subscriptions re-issued
    Connected { session_present: bool },
    /// A connect attempt failed; a retry follows after backoff
    ConnectionFailed(String),
    /// An established connection was lost
    Disconnected(String),
    /// The session was closed and will not reconnect
    Closed,
}

/// A message delivered by a broker
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub received_at: SystemTime,
}

/// Receives the messages of one session, sequentially
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: InboundMessage);
}

/// Anything that can publish to a broker
///
/// The command dispatcher only needs this much of a session, which keeps it
/// testable without a socket.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), SessionError>;
}

/// Supplies the MQTT password presented on every (re)connect
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Password for the next CONNECT, if any
    async fn password(&self) -> Result<Option<Bytes>, SessionError>;

    /// Called when the broker refused the presented credential
    async fn rejected(&self) {}
}

/// Fixed password from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticPassword(Option<Bytes>);

impl StaticPassword {
    pub fn new(password: Option<String>) -> Self {
        Self(password.map(Bytes::from))
    }
}

#[async_trait]
impl CredentialSource for StaticPassword {
    async fn password(&self) -> Result<Option<Bytes>, SessionError> {
        Ok(self.0.clone())
    }
}

/// Identity used to open a session
#[derive(Clone)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    /// Stable for the lifetime of the process
    pub client_id: String,
    pub username: Option<String>,
    pub auth: Arc<dyn CredentialSource>,
}

impl BrokerEndpoint {
    /// Build an endpoint from broker configuration. `role` tags the default
    /// client ID ("local", "remote").
    pub fn from_config(config: &BrokerConfig, role: &str, auth: Arc<dyn CredentialSource>) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            client_id: config.client_id_or_default(role),
            username: config.username.clone(),
            auth,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Tunables of a session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Name used in logs ("local", "remote")
    pub name: String,
    /// Keep-alive interval; zero disables pings
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub reconnect_interval: Duration,
    pub max_reconnect_interval: Duration,
    pub subscribe_qos: QoS,
    pub publish_qos: QoS,
    /// How long a QoS 1 publish waits for PUBACK
    pub publish_timeout: Duration,
    pub max_packet_size: usize,
    pub inbound_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            name: "session".to_string(),
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(1),
            max_reconnect_interval: Duration::from_secs(60),
            subscribe_qos: QoS::AtMostOnce,
            publish_qos: QoS::AtLeastOnce,
            publish_timeout: Duration::from_secs(10),
            max_packet_size: crate::codec::DEFAULT_MAX_PACKET_SIZE,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
        }
    }
}

impl SessionOptions {
    pub fn from_config(name: &str, config: &BrokerConfig) -> Self {
        Self {
            name: name.to_string(),
            keep_alive: Duration::from_secs(config.keepalive as u64),
            connect_timeout: config.connect_timeout_duration(),
            reconnect_interval: config.reconnect_interval_duration(),
            max_reconnect_interval: config.max_reconnect_interval_duration(),
            subscribe_qos: config.subscribe_qos(),
            publish_qos: config.publish_qos(),
            publish_timeout: config.publish_timeout,
            max_packet_size: config.max_packet_size,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
        }
    }

    /// Silence after which the link counts as dead
    pub fn idle_timeout(&self) -> Option<Duration> {
        if self.keep_alive.is_zero() {
            None
        } else {
            Some(self.keep_alive + self.keep_alive / 2)
        }
    }

    /// Next backoff delay after `current`
    pub fn next_backoff(&self, current: Duration) -> Duration {
        std::cmp::min(current * 2, self.max_reconnect_interval)
    }
}
