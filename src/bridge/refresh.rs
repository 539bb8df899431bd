//! Scheduled credential refresh

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::credential::CredentialManager;

/// Force a new login every `interval` until `cancel` fires.
///
/// A refresh in flight when `cancel` fires is abandoned. Failures are
/// logged; the held credential stays in place and the next tick retries.
pub fn spawn_refresh_task(
    credentials: Arc<CredentialManager>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("Credential refresh every {:?}", interval);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Credential refresh cancelled");
                    break;
                }
                result = credentials.force_refresh() => match result {
                    Ok(credential) => debug!("Scheduled refresh done (ttl={:?})", credential.ttl()),
                    Err(e) => warn!(
                        "Scheduled credential refresh failed, retrying in {:?}: {}",
                        interval, e
                    ),
                },
            }
        }

        debug!("Credential refresh stopped");
    })
}
