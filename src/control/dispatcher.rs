//! Command Dispatcher
//!
//! Renders decisions and property writes into device commands and publishes
//! them on the remote session. No deduplication: every call is one publish.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use super::policy::ControlDecision;
use super::properties::PropertyWrite;
use crate::session::{Publisher, SessionError};

/// One property write addressed to one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlCommand {
    pub product_id: String,
    pub device_id: String,
    pub property: PropertyWrite,
}

impl ControlCommand {
    pub fn new(product_id: &str, device_id: &str, property: PropertyWrite) -> Self {
        Self {
            product_id: product_id.to_string(),
            device_id: device_id.to_string(),
            property,
        }
    }

    /// `batteryTarget` command for a control decision
    pub fn battery_target(product_id: &str, device_id: &str, decision: ControlDecision) -> Self {
        Self::new(product_id, device_id, PropertyWrite::BatteryTarget(decision))
    }

    pub fn topic(&self) -> String {
        write_topic(&self.product_id, &self.device_id)
    }

    pub fn payload(&self) -> Bytes {
        Bytes::from(self.property.to_body().to_string())
    }
}

/// `iot/{product_id}/{device_id}/properties/write`
pub fn write_topic(product_id: &str, device_id: &str) -> String {
    format!("iot/{}/{}/properties/write", product_id, device_id)
}

/// Device report stream subscribed on the remote broker
pub fn report_filter(product_id: &str, device_id: &str) -> String {
    format!("/{}/{}/#", product_id, device_id)
}

/// Publishes device commands
#[derive(Clone)]
pub struct CommandDispatcher {
    publisher: Arc<dyn Publisher>,
}

impl CommandDispatcher {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self { publisher }
    }

    /// Publish the `batteryTarget` command for `decision`
    pub async fn dispatch(
        &self,
        decision: ControlDecision,
        product_id: &str,
        device_id: &str,
    ) -> Result<(), SessionError> {
        self.send(&ControlCommand::battery_target(product_id, device_id, decision))
            .await?;
        info!("Battery target set to {}", decision);
        Ok(())
    }

    /// Publish any validated property write
    pub async fn send(&self, command: &ControlCommand) -> Result<(), SessionError> {
        let topic = command.topic();
        let payload = command.payload();
        debug!(
            "Publishing {} to {}",
            String::from_utf8_lossy(&payload),
            topic
        );
        self.publisher.publish(&topic, payload).await
    }
}
