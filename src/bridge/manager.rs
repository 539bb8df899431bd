//! Bridge lifecycle
//!
//! Startup order: credential, remote session, local session, scheduled
//! refresh. Shutdown runs the other way round and is bounded by the
//! configured grace period.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handlers::{ReportHandler, TelemetryHandler, TelemetryStats};
use super::refresh::spawn_refresh_task;
use super::{BridgeError, BridgeState};
use crate::cloud::CloudClient;
use crate::config::Config;
use crate::control::{
    report_filter, CommandDispatcher, ControlCommand, PropertyWrite, ThresholdPolicy,
};
use crate::credential::{CredentialManager, LoginClient};
use crate::session::{
    BrokerEndpoint, BrokerSession, SessionError, SessionEvent, SessionOptions, SessionStatus,
    StaticPassword,
};

/// The running bridge between the local and the remote broker
pub struct Bridge {
    config: Config,
    credentials: Arc<CredentialManager>,
    cloud: Option<CloudClient>,
    state: watch::Sender<BridgeState>,
    started: AtomicBool,
    stats: Arc<TelemetryStats>,
}

impl Bridge {
    /// Validate `config` and prepare a bridge that logs in through `login`
    pub fn new(config: Config, login: Arc<dyn LoginClient>) -> Result<Self, BridgeError> {
        config.validate()?;

        let credentials = CredentialManager::new(login, config.cloud.token_ttl)
            .with_refresh_margin(config.cloud.refresh_margin);
        let (state, _) = watch::channel(BridgeState::Initializing);

        Ok(Self {
            config,
            credentials: Arc::new(credentials),
            cloud: None,
            state,
            started: AtomicBool::new(false),
            stats: Arc::new(TelemetryStats::default()),
        })
    }

    /// Use `cloud` to list the account's devices at startup
    pub fn with_device_lookup(mut self, cloud: CloudClient) -> Self {
        self.cloud = Some(cloud);
        self
    }

    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }

    pub fn credentials(&self) -> &Arc<CredentialManager> {
        &self.credentials
    }

    pub fn stats(&self) -> Arc<TelemetryStats> {
        self.stats.clone()
    }

    fn set_state(&self, state: BridgeState) {
        debug!("Bridge state: {:?}", state);
        self.state.send_replace(state);
    }

    /// Run until `shutdown` resolves. A bridge runs at most once.
    ///
    /// Fails only when the first login fails; connection problems after that
    /// are retried in the background.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), BridgeError>
    where
        F: Future<Output = ()>,
    {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::AlreadyStarted(self.state()));
        }
        tokio::pin!(shutdown);
        let config = &self.config;
        let device = &config.device;

        info!(
            "Starting bridge for device {}/{} (threshold {}W)",
            device.product_id, device.device_id, config.control.threshold_watts
        );

        let credential = match self.credentials.acquire().await {
            Ok(credential) => credential,
            Err(e) => {
                error!("Cloud login failed: {}", e);
                self.set_state(BridgeState::Stopped);
                return Err(BridgeError::AuthenticationFailed(e));
            }
        };
        info!("Cloud login succeeded (token valid for {:?})", credential.ttl());

        if let Some(cloud) = &self.cloud {
            self.log_devices(cloud, credential.token()).await;
        }

        let remote = Arc::new(self.connect_remote(vec![report_filter(
            &device.product_id,
            &device.device_id,
        )]));
        let mut monitors = vec![spawn_event_monitor(remote.name().to_string(), remote.events())];

        // The local session is only worth having once commands can go out
        let mut interrupted = !Self::wait_ready(
            &remote,
            config.remote.connect_timeout_duration(),
            &mut shutdown,
        )
        .await;

        let local = Arc::new(self.connect_local(CommandDispatcher::new(remote.clone())));
        monitors.push(spawn_event_monitor(local.name().to_string(), local.events()));

        if !interrupted {
            interrupted = !Self::wait_ready(
                &local,
                config.local.connect_timeout_duration(),
                &mut shutdown,
            )
            .await;
        }

        let cancel = CancellationToken::new();
        let refresh = spawn_refresh_task(
            self.credentials.clone(),
            config.cloud.refresh_interval,
            cancel.child_token(),
        );

        if !interrupted {
            self.set_state(BridgeState::Running);
            info!("Bridge running");
            shutdown.await;
        }

        self.set_state(BridgeState::ShuttingDown);
        info!("Bridge shutting down");
        self.stop(cancel, refresh, &local, &remote, monitors).await;

        let (received, dispatched, malformed, failed) = self.stats.snapshot();
        info!(
            "Bridge stopped ({} readings, {} commands, {} malformed, {} failed)",
            received, dispatched, malformed, failed
        );
        self.set_state(BridgeState::Stopped);
        Ok(())
    }

    /// Send one property write to the configured device and disconnect
    pub async fn write_property(&self, property: PropertyWrite) -> Result<(), BridgeError> {
        let device = &self.config.device;
        self.credentials.acquire().await?;

        let remote = Arc::new(self.connect_remote(Vec::new()));
        let timeout = self.config.remote.connect_timeout_duration() * 2;
        let result = if wait_connected(&remote, timeout).await {
            let command =
                ControlCommand::new(&device.product_id, &device.device_id, property);
            info!(
                "Writing {}={} to {}",
                command.property.name(),
                command.property.value(),
                command.topic()
            );
            CommandDispatcher::new(remote.clone())
                .send(&command)
                .await
                .map_err(BridgeError::PublishFailed)
        } else {
            Err(BridgeError::ConnectionLost(SessionError::Timeout))
        };

        if let Err(e) = remote.close().await {
            warn!("Bridge: closing remote session: {}", e);
        }
        result
    }

    fn connect_remote(&self, mut topics: Vec<String>) -> BrokerSession {
        let remote = &self.config.remote;
        topics.extend(remote.topics.iter().cloned());

        BrokerSession::connect(
            BrokerEndpoint::from_config(remote, "remote", self.credentials.clone()),
            SessionOptions::from_config("remote", remote),
            topics,
            Arc::new(ReportHandler),
        )
    }

    fn connect_local(&self, dispatcher: CommandDispatcher) -> BrokerSession {
        let local = &self.config.local;
        let device = &self.config.device;

        let handler = TelemetryHandler::new(
            local.topics.clone(),
            ThresholdPolicy::new(self.config.control.threshold_watts),
            dispatcher,
            &device.product_id,
            &device.device_id,
        )
        .with_stats(self.stats.clone());

        BrokerSession::connect(
            BrokerEndpoint::from_config(
                local,
                "local",
                Arc::new(StaticPassword::new(local.password.clone())),
            ),
            SessionOptions::from_config("local", local),
            local.topics.clone(),
            Arc::new(handler),
        )
    }

    /// Wait for the first connect of `session`, giving up after its connect
    /// timeout. Returns false if `shutdown` fired meanwhile.
    async fn wait_ready<F>(
        session: &BrokerSession,
        timeout: Duration,
        shutdown: &mut Pin<&mut F>,
    ) -> bool
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            _ = shutdown.as_mut() => false,
            connected = wait_connected(session, timeout) => {
                if !connected {
                    warn!(
                        "Bridge: {} broker not reachable yet, retrying in the background",
                        session.name()
                    );
                }
                true
            }
        }
    }

    async fn log_devices(&self, cloud: &CloudClient, token: &str) {
        let device = &self.config.device;
        match cloud.device_list(token).await {
            Ok(devices) if devices.is_empty() => debug!("Device list not available"),
            Ok(devices) => {
                for d in &devices {
                    info!(
                        "Cloud device: {} ({}) {}/{}",
                        d.device_name.as_deref().unwrap_or("unnamed"),
                        d.product_name.as_deref().unwrap_or("unknown product"),
                        d.product_key,
                        d.device_key
                    );
                }
                let known = devices
                    .iter()
                    .any(|d| d.product_key == device.product_id && d.device_key == device.device_id);
                if !known {
                    warn!(
                        "Configured device {}/{} is not in the account's device list",
                        device.product_id, device.device_id
                    );
                }
            }
            Err(e) => warn!("Could not fetch device list: {}", e),
        }
    }

    async fn stop(
        &self,
        cancel: CancellationToken,
        refresh: JoinHandle<()>,
        local: &BrokerSession,
        remote: &BrokerSession,
        monitors: Vec<JoinHandle<()>>,
    ) {
        let grace = self.config.shutdown.grace_period;
        let deadline = Instant::now() + grace;
        cancel.cancel();

        // Both closes are attempted even when one of them fails
        let closing = async {
            let (local_result, remote_result) = tokio::join!(local.close(), remote.close());
            for (name, result) in [("local", local_result), ("remote", remote_result)] {
                if let Err(e) = result {
                    error!("Bridge: closing {} session: {}", name, e);
                }
            }
        };
        if tokio::time::timeout_at(deadline, closing).await.is_err() {
            warn!("Bridge: sessions did not close within {:?}", grace);
        }

        join_by(refresh, deadline, "credential refresh").await;
        for monitor in monitors {
            join_by(monitor, deadline, "event monitor").await;
        }
    }
}

/// True once `session` reports Connected, false after `timeout`
async fn wait_connected(session: &BrokerSession, timeout: Duration) -> bool {
    // Subscribe before looking at the status so the event cannot slip by
    let mut events = session.events();
    if session.status() == SessionStatus::Connected {
        return true;
    }

    let connected = async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Connected { .. }) => return true,
                Ok(SessionEvent::Closed) | Err(broadcast::error::RecvError::Closed) => return false,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if session.status() == SessionStatus::Connected {
                        return true;
                    }
                }
            }
        }
    };
    tokio::time::timeout(timeout, connected).await.unwrap_or(false)
}

fn spawn_event_monitor(
    name: String,
    mut events: broadcast::Receiver<SessionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Connected { session_present }) => {
                    info!("Bridge: {} broker ready (session present: {})", name, session_present)
                }
                Ok(SessionEvent::ConnectionFailed(reason)) => {
                    debug!("Bridge: {} connect attempt failed: {}", name, reason)
                }
                Ok(SessionEvent::Disconnected(reason)) => {
                    warn!("Bridge: {} broker lost ({}), reconnecting", name, reason)
                }
                Ok(SessionEvent::Closed) | Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("Bridge: {} monitor skipped {} events", name, n)
                }
            }
        }
    })
}

/// Await `task` until `deadline`, aborting it if it is still running then
pub(super) async fn join_by(task: JoinHandle<()>, deadline: Instant, what: &str) {
    let abort = task.abort_handle();
    match tokio::time::timeout_at(deadline, task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_cancelled() => {}
        Ok(Err(e)) => error!("Bridge: {} task failed: {}", what, e),
        Err(_) => {
            warn!("Bridge: {} did not stop by the shutdown deadline, aborting", what);
            abort.abort();
        }
    }
}
