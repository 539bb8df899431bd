//! SolarFlow Bridge - grid-power driven battery control
//!
//! Listens to grid-power telemetry on a local MQTT broker and answers every
//! reading with a `batteryTarget` command on the cloud broker fronting the
//! storage device, keeping the cloud access token fresh in the background.

pub mod bridge;
pub mod cloud;
pub mod codec;
pub mod config;
pub mod control;
pub mod credential;
pub mod protocol;
pub mod session;
pub mod topic;

pub use bridge::{Bridge, BridgeError, BridgeState};
pub use cloud::CloudClient;
pub use config::Config;
pub use control::{CommandDispatcher, ControlDecision, PropertyWrite, ThresholdPolicy};
pub use credential::{Credential, CredentialManager};
pub use protocol::QoS;
pub use session::{BrokerSession, SessionError, SessionEvent, SessionStatus};
