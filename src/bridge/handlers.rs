//! Per-session message handlers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::BridgeError;
use crate::control::{CommandDispatcher, ControlDecision, ThresholdPolicy};
use crate::session::{InboundMessage, MessageHandler};
use crate::topic::matches_any;

/// Counters of the telemetry path
#[derive(Debug, Default)]
pub struct TelemetryStats {
    pub received: AtomicU64,
    pub dispatched: AtomicU64,
    pub malformed: AtomicU64,
    pub publish_failed: AtomicU64,
}

impl TelemetryStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.received.load(Ordering::Relaxed),
            self.dispatched.load(Ordering::Relaxed),
            self.malformed.load(Ordering::Relaxed),
            self.publish_failed.load(Ordering::Relaxed),
        )
    }
}

/// Local session handler: telemetry -> policy -> dispatcher
pub struct TelemetryHandler {
    topics: Vec<String>,
    policy: ThresholdPolicy,
    dispatcher: CommandDispatcher,
    product_id: String,
    device_id: String,
    stats: Arc<TelemetryStats>,
}

impl TelemetryHandler {
    pub fn new(
        topics: Vec<String>,
        policy: ThresholdPolicy,
        dispatcher: CommandDispatcher,
        product_id: &str,
        device_id: &str,
    ) -> Self {
        Self {
            topics,
            policy,
            dispatcher,
            product_id: product_id.to_string(),
            device_id: device_id.to_string(),
            stats: Arc::new(TelemetryStats::default()),
        }
    }

    /// Count into `stats` instead of a private set of counters
    pub fn with_stats(mut self, stats: Arc<TelemetryStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> Arc<TelemetryStats> {
        self.stats.clone()
    }

    /// Evaluate one telemetry message and publish the resulting command
    pub async fn process(&self, message: &InboundMessage) -> Result<ControlDecision, BridgeError> {
        let (watts, decision) = self.policy.evaluate(&message.payload)?;
        info!(
            "Grid power is {}W on {}, setting battery target to {}",
            watts, message.topic, decision
        );

        self.dispatcher
            .dispatch(decision, &self.product_id, &self.device_id)
            .await
            .map_err(BridgeError::PublishFailed)?;
        Ok(decision)
    }
}

#[async_trait]
impl MessageHandler for TelemetryHandler {
    async fn handle(&self, message: InboundMessage) {
        if !matches_any(&message.topic, &self.topics) {
            debug!("Ignoring message on non-telemetry topic {}", message.topic);
            return;
        }
        TelemetryStats::bump(&self.stats.received);

        match self.process(&message).await {
            Ok(_) => TelemetryStats::bump(&self.stats.dispatched),
            Err(BridgeError::MalformedTelemetry(e)) => {
                TelemetryStats::bump(&self.stats.malformed);
                warn!("Dropping telemetry on {}: {}", message.topic, e);
            }
            Err(e) => {
                // The next reading re-evaluates and publishes again
                TelemetryStats::bump(&self.stats.publish_failed);
                warn!("Battery command not delivered: {}", e);
            }
        }
    }
}

/// Remote session handler: device reports are only logged
pub struct ReportHandler;

#[async_trait]
impl MessageHandler for ReportHandler {
    async fn handle(&self, message: InboundMessage) {
        info!(
            "Device report on {}: {}",
            message.topic,
            String::from_utf8_lossy(&message.payload)
        );
    }
}
