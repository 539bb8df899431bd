//! Bridge Orchestrator
//!
//! Wires the local telemetry session, the control policy, the command
//! dispatcher and the remote cloud session together, and runs the scheduled
//! credential refresh next to message delivery.
//!
//! ```text
//! local broker -> local session -> TelemetryHandler -> ThresholdPolicy
//!                                                   -> CommandDispatcher -> remote session
//! ```
//!
//! Lifecycle: `Initializing -> Running -> ShuttingDown -> Stopped`, never
//! backwards.

mod handlers;
mod manager;
mod refresh;


pub use handlers::{ReportHandler, TelemetryHandler, TelemetryStats};
pub use manager::Bridge;
pub use refresh::spawn_refresh_task;

use std::fmt;

use crate::config::ConfigError;
use crate::control::PolicyError;
use crate::credential::AuthError;
use crate::session::SessionError;

/// Lifecycle state of the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
}

/// Failure kinds of the bridge.
///
/// Only `ConfigurationInvalid` and an `AuthenticationFailed` during startup
/// end the process; everything else is logged and contained.
#[derive(Debug)]
pub enum BridgeError {
    ConfigurationInvalid(ConfigError),
    AuthenticationFailed(AuthError),
    ConnectionLost(SessionError),
    MalformedTelemetry(PolicyError),
    PublishFailed(SessionError),
    /// `run` was called on a bridge that has already been started
    AlreadyStarted(BridgeState),
}

impl BridgeError {
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            BridgeError::ConfigurationInvalid(_) | BridgeError::AuthenticationFailed(_)
        )
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::ConfigurationInvalid(e) => write!(f, "Configuration invalid: {}", e),
            BridgeError::AuthenticationFailed(e) => write!(f, "Authentication failed: {}", e),
            BridgeError::ConnectionLost(e) => write!(f, "Connection lost: {}", e),
            BridgeError::MalformedTelemetry(e) => write!(f, "{}", e),
            BridgeError::PublishFailed(e) => write!(f, "Publish failed: {}", e),
            BridgeError::AlreadyStarted(state) => {
                write!(f, "Bridge already started (state {:?})", state)
            }
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BridgeError::ConfigurationInvalid(e) => Some(e),
            BridgeError::AuthenticationFailed(e) => Some(e),
            BridgeError::ConnectionLost(e) | BridgeError::PublishFailed(e) => Some(e),
            BridgeError::MalformedTelemetry(e) => Some(e),
            BridgeError::AlreadyStarted(_) => None,
        }
    }
}

impl From<ConfigError> for BridgeError {
    fn from(e: ConfigError) -> Self {
        BridgeError::ConfigurationInvalid(e)
    }
}

impl From<AuthError> for BridgeError {
    fn from(e: AuthError) -> Self {
        BridgeError::AuthenticationFailed(e)
    }
}

impl From<PolicyError> for BridgeError {
    fn from(e: PolicyError) -> Self {
        BridgeError::MalformedTelemetry(e)
    }
}
