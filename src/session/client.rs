//! Session handle and connection loop

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::framed::{self, PacketReader, PacketWriter};
use super::{
    BrokerEndpoint, InboundMessage, MessageHandler, Publisher, SessionError, SessionEvent,
    SessionOptions, SessionStatus,
};
use crate::protocol::{
    Connect, ConnectReturnCode, Packet, PubAck, Publish, QoS, SubAck, Subscribe, Subscription,
};

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Request from a session handle to its connection task
#[derive(Debug)]
enum Command {
    Publish {
        topic: String,
        payload: Bytes,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Subscribe {
        filters: Vec<String>,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
}

impl Command {
    /// Answer a command that arrived while no connection is up
    fn answer_offline(self) {
        match self {
            Command::Publish { reply, .. } => {
                let _ = reply.send(Err(SessionError::NotConnected));
            }
            // Already part of the subscription set, issued on the next connect
            Command::Subscribe { reply, .. } => {
                let _ = reply.send(Ok(()));
            }
        }
    }
}

/// Request waiting for its acknowledgement
enum Pending {
    Publish(oneshot::Sender<Result<(), SessionError>>),
    Subscribe {
        filters: Vec<String>,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
}

impl Pending {
    fn fail(self, error: SessionError) {
        let reply = match self {
            Pending::Publish(reply) => reply,
            Pending::Subscribe { reply, .. } => reply,
        };
        let _ = reply.send(Err(error));
    }
}

/// State visible to both the handle and the connection task
struct Shared {
    status: RwLock<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
    topics: RwLock<Vec<String>>,
}

impl Shared {
    fn set_status(&self, status: SessionStatus) {
        *self.status.write() = status;
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }
}

/// Handle to one broker session
///
/// Created with [`BrokerSession::connect`], which spawns the connection and
/// delivery tasks. Dropping the handle stops both; [`BrokerSession::close`]
/// additionally waits for them to finish.
pub struct BrokerSession {
    name: String,
    publish_timeout: Duration,
    shared: Arc<Shared>,
    command_tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BrokerSession {
    /// Open a session. Returns immediately; the connection is established
    /// (and re-established) in the background, subscribing to `topics` each
    /// time before the session reports itself connected.
    pub fn connect(
        endpoint: BrokerEndpoint,
        options: SessionOptions,
        topics: Vec<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(options.inbound_capacity.max(1));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            status: RwLock::new(SessionStatus::Disconnected),
            events,
            topics: RwLock::new(dedup(topics)),
        });
        let cancel = CancellationToken::new();
        let name = options.name.clone();
        let publish_timeout = options.publish_timeout;

        let delivery = tokio::spawn(deliver_loop(
            name.clone(),
            inbound_rx,
            handler,
            cancel.clone(),
        ));

        let driver = Driver {
            endpoint,
            options,
            shared: shared.clone(),
            commands: command_rx,
            inbound: inbound_tx,
            cancel: cancel.clone(),
            last_packet_id: 0,
        };
        let connection = tokio::spawn(driver.run());

        Self {
            name,
            publish_timeout,
            shared,
            command_tx,
            cancel,
            tasks: Mutex::new(vec![connection, delivery]),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> SessionStatus {
        *self.shared.status.read()
    }

    /// Subscribe to connection lifecycle events
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Current subscription set
    pub fn topics(&self) -> Vec<String> {
        self.shared.topics.read().clone()
    }

    /// Add topic filters to the subscription set.
    ///
    /// When connected, waits for the broker's SUBACK. Otherwise the filters
    /// are issued on the next connect.
    pub async fn subscribe(&self, filters: &[String]) -> Result<(), SessionError> {
        if self.status() == SessionStatus::Closed {
            return Err(SessionError::Closed);
        }

        let added: Vec<String> = {
            let mut topics = self.shared.topics.write();
            let added: Vec<String> = dedup(filters.to_vec())
                .into_iter()
                .filter(|f| !topics.contains(f))
                .collect();
            topics.extend(added.iter().cloned());
            added
        };
        if added.is_empty() {
            return Ok(());
        }

        let (reply, rx) = oneshot::channel();
        self.request(
            Command::Subscribe {
                filters: added,
                reply,
            },
            rx,
        )
        .await
    }

    /// Publish `payload` to `topic` with the configured QoS.
    ///
    /// Fails immediately with `NotConnected` when the session is down; a
    /// QoS 1 publish returns once the broker acknowledged it.
    pub async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), SessionError> {
        match self.status() {
            SessionStatus::Connected => {}
            SessionStatus::Closed => return Err(SessionError::Closed),
            _ => return Err(SessionError::NotConnected),
        }

        let (reply, rx) = oneshot::channel();
        self.request(
            Command::Publish {
                topic: topic.to_string(),
                payload,
                reply,
            },
            rx,
        )
        .await
    }

    async fn request(
        &self,
        command: Command,
        rx: oneshot::Receiver<Result<(), SessionError>>,
    ) -> Result<(), SessionError> {
        let exchange = async {
            self.command_tx
                .send(command)
                .await
                .map_err(|_| SessionError::Closed)?;
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(SessionError::ConnectionLost(
                    "Connection lost before acknowledgement".to_string(),
                )),
            }
        };

        timeout(self.publish_timeout, exchange)
            .await
            .map_err(|_| SessionError::Timeout)?
    }

    /// Disconnect and stop reconnecting. Safe to call more than once.
    pub async fn close(&self) -> Result<(), SessionError> {
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        let mut result = Ok(());
        for task in tasks {
            if let Err(e) = task.await {
                error!("Session '{}': task failed: {}", self.name, e);
                result = Err(SessionError::Task(e.to_string()));
            }
        }
        result
    }
}

impl Drop for BrokerSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl Publisher for BrokerSession {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), SessionError> {
        BrokerSession::publish(self, topic, payload).await
    }
}

/// Hands queued messages to the handler one at a time
async fn deliver_loop(
    name: String,
    mut inbound: mpsc::Receiver<InboundMessage>,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = inbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        handler.handle(message).await;
    }
    debug!("Session '{}': delivery stopped", name);
}

/// Owns the socket and runs connect, serve and backoff in a loop
struct Driver {
    endpoint: BrokerEndpoint,
    options: SessionOptions,
    shared: Arc<Shared>,
    commands: mpsc::Receiver<Command>,
    inbound: mpsc::Sender<InboundMessage>,
    cancel: CancellationToken,
    last_packet_id: u16,
}

impl Driver {
    async fn run(mut self) {
        let name = self.options.name.clone();
        let cancel = self.cancel.clone();
        let mut retry_interval = self.options.reconnect_interval;

        loop {
            self.shared.set_status(SessionStatus::Connecting);
            debug!(
                "Session '{}': Connecting to {} as '{}'",
                name,
                self.endpoint.address(),
                self.endpoint.client_id
            );

            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                attempt = self.establish() => attempt,
            };

            match attempt {
                Ok((reader, writer, session_present)) => {
                    retry_interval = self.options.reconnect_interval;
                    self.shared.set_status(SessionStatus::Connected);
                    self.shared.emit(SessionEvent::Connected { session_present });
                    info!(
                        "Session '{}': Connected to {} (session_present={})",
                        name,
                        self.endpoint.address(),
                        session_present
                    );

                    match self.serve(reader, writer).await {
                        Ok(()) => break,
                        Err(e) => {
                            warn!("Session '{}': Connection lost: {}", name, e);
                            self.shared.emit(SessionEvent::Disconnected(e.to_string()));
                        }
                    }
                }
                Err(e) => {
                    error!("Session '{}': Connection failed: {}", name, e);
                    if let SessionError::Rejected(code) = &e {
                        if code.is_auth_failure() {
                            self.endpoint.auth.rejected().await;
                        }
                    }
                    self.shared.emit(SessionEvent::ConnectionFailed(e.to_string()));
                }
            }

            self.shared.set_status(SessionStatus::Backoff);
            debug!("Session '{}': Reconnecting in {:?}", name, retry_interval);
            if !self.backoff(retry_interval).await {
                break;
            }
            retry_interval = self.options.next_backoff(retry_interval);
        }

        self.shared.set_status(SessionStatus::Closed);
        self.shared.emit(SessionEvent::Closed);
        info!("Session '{}': Closed", name);
    }

    /// Wait out a backoff delay. Returns false when the session should stop.
    async fn backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    Some(command) => command.answer_offline(),
                    None => return false,
                },
            }
        }
    }

    /// TCP connect, CONNECT/CONNACK and re-subscribe
    async fn establish(&mut self) -> Result<(PacketReader, PacketWriter, bool), SessionError> {
        let connect_timeout = self.options.connect_timeout;
        let password = self.endpoint.auth.password().await?;

        let stream = timeout(connect_timeout, TcpStream::connect(self.endpoint.address()))
            .await
            .map_err(|_| SessionError::Timeout)??;
        let (mut reader, mut writer) = framed::split(stream, self.options.max_packet_size);

        let connect = Packet::Connect(Box::new(Connect {
            client_id: self.endpoint.client_id.clone(),
            clean_session: true,
            keep_alive: u16::try_from(self.options.keep_alive.as_secs()).unwrap_or(u16::MAX),
            username: self.endpoint.username.clone(),
            password,
        }));
        writer.send(&connect).await?;

        let session_present = match timeout(connect_timeout, reader.recv())
            .await
            .map_err(|_| SessionError::Timeout)??
        {
            Packet::ConnAck(ack) if ack.return_code == ConnectReturnCode::Accepted => {
                ack.session_present
            }
            Packet::ConnAck(ack) => return Err(SessionError::Rejected(ack.return_code)),
            other => {
                return Err(SessionError::Protocol(format!(
                    "Expected CONNACK, got {}",
                    other.name()
                )))
            }
        };

        // Subscriptions do not survive a reconnect: re-issue all of them
        let filters = self.shared.topics.read().clone();
        if !filters.is_empty() {
            let packet_id = self.next_packet_id(&HashMap::new());
            writer
                .send(&subscribe_packet(packet_id, &filters, self.options.subscribe_qos))
                .await?;

            let deadline = Instant::now() + connect_timeout;
            loop {
                match timeout_at(deadline, reader.recv())
                    .await
                    .map_err(|_| SessionError::Timeout)??
                {
                    Packet::SubAck(ack) if ack.packet_id == packet_id => {
                        let refused = refused_filters(&filters, &ack);
                        if !refused.is_empty() {
                            warn!(
                                "Session '{}': Broker refused subscriptions: {}",
                                self.options.name,
                                refused.join(", ")
                            );
                        }
                        debug!(
                            "Session '{}': Subscribed to {} topics",
                            self.options.name,
                            filters.len()
                        );
                        break;
                    }
                    Packet::Publish(publish) => self.deliver(publish, &mut writer).await?,
                    other => trace!(
                        "Session '{}': Ignoring {} while subscribing",
                        self.options.name,
                        other.name()
                    ),
                }
            }
        }

        Ok((reader, writer, session_present))
    }

    /// Message loop of an established connection.
    ///
    /// Returns `Ok` when the session was closed, `Err` when the connection
    /// was lost.
    async fn serve(
        &mut self,
        mut reader: PacketReader,
        mut writer: PacketWriter,
    ) -> Result<(), SessionError> {
        let cancel = self.cancel.clone();
        let mut pending: HashMap<u16, Pending> = HashMap::new();

        let keep_alive = self.options.keep_alive;
        let pinging = !keep_alive.is_zero();
        let ping_period = keep_alive.max(Duration::from_secs(1));
        let mut ping = tokio::time::interval_at(Instant::now() + ping_period, ping_period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let idle_timeout = self.options.idle_timeout();
        let idle = tokio::time::sleep(idle_timeout.unwrap_or(ping_period));
        tokio::pin!(idle);

        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Session '{}': Sending DISCONNECT", self.options.name);
                    let _ = writer.send(&Packet::Disconnect).await;
                    writer.shutdown().await;
                    break Ok(());
                }
                packet = reader.recv() => {
                    let packet = match packet {
                        Ok(packet) => packet,
                        Err(e) => break Err(e),
                    };
                    if let Some(limit) = idle_timeout {
                        idle.as_mut().reset(Instant::now() + limit);
                    }
                    if let Err(e) = self.on_packet(packet, &mut writer, &mut pending).await {
                        break Err(e);
                    }
                }
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Err(e) = self.on_command(command, &mut writer, &mut pending).await {
                            break Err(e);
                        }
                    }
                    None => {
                        let _ = writer.send(&Packet::Disconnect).await;
                        break Ok(());
                    }
                },
                _ = ping.tick(), if pinging => {
                    trace!("Session '{}': PINGREQ", self.options.name);
                    if let Err(e) = writer.send(&Packet::PingReq).await {
                        break Err(e);
                    }
                }
                _ = &mut idle, if idle_timeout.is_some() => {
                    break Err(SessionError::ConnectionLost("Keep alive timeout".to_string()));
                }
            }
        };

        self.shared.set_status(SessionStatus::Disconnected);
        for (_, waiting) in pending.drain() {
            waiting.fail(SessionError::ConnectionLost(
                "Connection lost before acknowledgement".to_string(),
            ));
        }
        result
    }

    async fn on_packet(
        &mut self,
        packet: Packet,
        writer: &mut PacketWriter,
        pending: &mut HashMap<u16, Pending>,
    ) -> Result<(), SessionError> {
        match packet {
            Packet::Publish(publish) => self.deliver(publish, writer).await,
            Packet::PubAck(ack) => {
                match pending.remove(&ack.packet_id) {
                    Some(Pending::Publish(reply)) => {
                        let _ = reply.send(Ok(()));
                    }
                    Some(other) => {
                        other.fail(SessionError::Protocol("Unexpected PUBACK".to_string()));
                    }
                    None => debug!(
                        "Session '{}': PUBACK for unknown packet id {}",
                        self.options.name, ack.packet_id
                    ),
                }
                Ok(())
            }
            Packet::SubAck(ack) => {
                match pending.remove(&ack.packet_id) {
                    Some(Pending::Subscribe { filters, reply }) => {
                        let refused = refused_filters(&filters, &ack);
                        let result = if refused.is_empty() {
                            debug!(
                                "Session '{}': Subscribed to {}",
                                self.options.name,
                                filters.join(", ")
                            );
                            Ok(())
                        } else {
                            Err(SessionError::SubscribeRejected(refused))
                        };
                        let _ = reply.send(result);
                    }
                    Some(other) => {
                        other.fail(SessionError::Protocol("Unexpected SUBACK".to_string()));
                    }
                    None => debug!(
                        "Session '{}': SUBACK for unknown packet id {}",
                        self.options.name, ack.packet_id
                    ),
                }
                Ok(())
            }
            Packet::PingResp => {
                trace!("Session '{}': PINGRESP", self.options.name);
                Ok(())
            }
            Packet::Disconnect => Err(SessionError::ConnectionLost(
                "Broker sent DISCONNECT".to_string(),
            )),
            other => Err(SessionError::Protocol(format!(
                "Unexpected {} from broker",
                other.name()
            ))),
        }
    }

    async fn on_command(
        &mut self,
        command: Command,
        writer: &mut PacketWriter,
        pending: &mut HashMap<u16, Pending>,
    ) -> Result<(), SessionError> {
        match command {
            Command::Publish {
                topic,
                payload,
                reply,
            } => {
                let qos = self.options.publish_qos;
                let packet_id = match qos {
                    QoS::AtMostOnce => None,
                    _ => Some(self.next_packet_id(pending)),
                };
                let publish = Packet::Publish(Publish::new(&topic, payload, qos, packet_id));

                match writer.send(&publish).await {
                    Ok(()) => {}
                    // Nothing was written; the connection is still usable
                    Err(SessionError::Protocol(msg)) => {
                        let _ = reply.send(Err(SessionError::Protocol(msg)));
                        return Ok(());
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.clone()));
                        return Err(e);
                    }
                }

                debug!(
                    "Session '{}': PUBLISH {} (qos={:?}, id={:?})",
                    self.options.name, topic, qos, packet_id
                );
                match packet_id {
                    Some(id) => {
                        pending.insert(id, Pending::Publish(reply));
                    }
                    None => {
                        let _ = reply.send(Ok(()));
                    }
                }
                Ok(())
            }
            Command::Subscribe { filters, reply } => {
                let packet_id = self.next_packet_id(pending);
                let subscribe = subscribe_packet(packet_id, &filters, self.options.subscribe_qos);
                if let Err(e) = writer.send(&subscribe).await {
                    let _ = reply.send(Err(e.clone()));
                    return match e {
                        SessionError::Protocol(_) => Ok(()),
                        e => Err(e),
                    };
                }
                pending.insert(packet_id, Pending::Subscribe { filters, reply });
                Ok(())
            }
        }
    }

    /// Queue an incoming message for the handler, then acknowledge it.
    /// Messages arriving while the queue is full are dropped.
    async fn deliver(
        &self,
        publish: Publish,
        writer: &mut PacketWriter,
    ) -> Result<(), SessionError> {
        trace!(
            "Session '{}': Received {} bytes on {}",
            self.options.name,
            publish.payload.len(),
            publish.topic
        );

        let message = InboundMessage {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
            received_at: SystemTime::now(),
        };
        // Never wait on a slow handler here; keep-alive and commands share this task
        match self.inbound.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => warn!(
                "Session '{}': Delivery queue full, dropping message on {}",
                self.options.name, message.topic
            ),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Session '{}': Delivery stopped, message dropped", self.options.name)
            }
        }

        if publish.qos == QoS::AtLeastOnce {
            if let Some(packet_id) = publish.packet_id {
                writer.send(&Packet::PubAck(PubAck { packet_id })).await?;
            }
        }
        Ok(())
    }

    /// Next free non-zero packet identifier
    fn next_packet_id(&mut self, pending: &HashMap<u16, Pending>) -> u16 {
        loop {
            self.last_packet_id = self.last_packet_id.wrapping_add(1);
            if self.last_packet_id != 0 && !pending.contains_key(&self.last_packet_id) {
                return self.last_packet_id;
            }
        }
    }
}

fn subscribe_packet(packet_id: u16, filters: &[String], qos: QoS) -> Packet {
    Packet::Subscribe(Subscribe {
        packet_id,
        subscriptions: filters
            .iter()
            .map(|filter| Subscription {
                filter: filter.clone(),
                qos,
            })
            .collect(),
    })
}

/// Filters the broker answered with a failure code
fn refused_filters(filters: &[String], ack: &SubAck) -> Vec<String> {
    filters
        .iter()
        .zip(ack.granted.iter())
        .filter(|(_, granted)| granted.is_none())
        .map(|(filter, _)| filter.clone())
        .collect()
}

fn dedup(filters: Vec<String>) -> Vec<String> {
    let mut unique = Vec::with_capacity(filters.len());
    for filter in filters {
        if !unique.contains(&filter) {
            unique.push(filter);
        }
    }
    unique
}
