//! Broker session tests against an in-process broker

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use pretty_assertions::assert_eq;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;

use common::{closed_port, FakeBroker};
use solarflow_bridge::session::{
    BrokerEndpoint, BrokerSession, InboundMessage, MessageHandler, SessionError, SessionEvent,
    SessionOptions, SessionStatus, StaticPassword,
};

struct ChannelHandler(mpsc::UnboundedSender<InboundMessage>);

#[async_trait]
impl MessageHandler for ChannelHandler {
    async fn handle(&self, message: InboundMessage) {
        let _ = self.0.send(message);
    }
}

/// Blocks inside `handle` until the gate is closed
struct StalledHandler {
    gate: Arc<Semaphore>,
    handled: mpsc::UnboundedSender<InboundMessage>,
}

#[async_trait]
impl MessageHandler for StalledHandler {
    async fn handle(&self, message: InboundMessage) {
        let _ = self.handled.send(message);
        let _ = self.gate.acquire().await;
    }
}

fn endpoint(port: u16, password: Option<&str>) -> BrokerEndpoint {
    BrokerEndpoint {
        host: "127.0.0.1".to_string(),
        port,
        client_id: "session-test".to_string(),
        username: Some("meter".to_string()),
        auth: Arc::new(StaticPassword::new(password.map(str::to_string))),
    }
}

fn options() -> SessionOptions {
    SessionOptions {
        name: "test".to_string(),
        connect_timeout: Duration::from_secs(2),
        reconnect_interval: Duration::from_millis(100),
        max_reconnect_interval: Duration::from_millis(400),
        publish_timeout: Duration::from_millis(500),
        ..SessionOptions::default()
    }
}

fn connect(
    port: u16,
    topics: &[&str],
) -> (BrokerSession, mpsc::UnboundedReceiver<InboundMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let session = BrokerSession::connect(
        endpoint(port, Some("secret")),
        options(),
        topics.iter().map(|t| t.to_string()).collect(),
        Arc::new(ChannelHandler(tx)),
    );
    (session, rx)
}

async fn wait_connected(session: &BrokerSession) {
    common::wait_until(|| session.status() == SessionStatus::Connected, "connected").await;
}

#[tokio::test]
async fn test_connect_presents_identity_and_subscribes() {
    let broker = FakeBroker::start().await;
    let (session, _rx) = connect(broker.port(), &["tele/+/power", "tele/meter/voltage"]);

    wait_connected(&session).await;

    let connects = broker.connects();
    assert_eq!(connects.len(), 1);
    assert_eq!(connects[0].client_id, "session-test");
    assert_eq!(connects[0].username.as_deref(), Some("meter"));
    assert_eq!(connects[0].password.as_deref(), Some(&b"secret"[..]));
    assert!(connects[0].clean_session);
    assert_eq!(
        broker.subscribes(),
        vec![vec![
            "tele/+/power".to_string(),
            "tele/meter/voltage".to_string()
        ]]
    );

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_messages_reach_handler_in_order() {
    let broker = FakeBroker::start().await;
    let (session, mut rx) = connect(broker.port(), &["tele/#"]);
    wait_connected(&session).await;

    assert_eq!(broker.inject("tele/meter/power", b"450"), 1);
    assert_eq!(broker.inject("tele/meter/power", b"120"), 1);
    assert_eq!(broker.inject("other/topic", b"999"), 0);

    let first = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    let second = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(&*first.topic, "tele/meter/power");
    assert_eq!(first.payload, Bytes::from_static(b"450"));
    assert_eq!(second.payload, Bytes::from_static(b"120"));

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_reconnects_and_resubscribes_after_drop() {
    let broker = FakeBroker::start().await;
    let (session, mut rx) = connect(broker.port(), &["tele/meter/power"]);
    let mut events = session.events();
    wait_connected(&session).await;

    broker.kick_all();

    broker.wait_for_connects(2).await;
    broker.wait_for_subscribes(2).await;
    wait_connected(&session).await;
    assert_eq!(broker.subscribes()[1], vec!["tele/meter/power".to_string()]);

    let mut saw_disconnect = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SessionEvent::Disconnected(_)) {
            saw_disconnect = true;
        }
    }
    assert!(saw_disconnect);

    broker.inject("tele/meter/power", b"301");
    let message = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(message.payload, Bytes::from_static(b"301"));

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_runtime_subscribe_is_kept_across_reconnects() {
    let broker = FakeBroker::start().await;
    let (session, _rx) = connect(broker.port(), &["a/b"]);
    wait_connected(&session).await;

    session.subscribe(&["c/d".to_string()]).await.unwrap();
    assert_eq!(session.topics(), vec!["a/b".to_string(), "c/d".to_string()]);

    broker.kick_all();
    broker.wait_for_subscribes(3).await;
    assert_eq!(
        broker.subscribes()[2],
        vec!["a/b".to_string(), "c/d".to_string()]
    );

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_qos1_publish_waits_for_puback() {
    let broker = FakeBroker::start().await;
    let (session, _rx) = connect(broker.port(), &["x"]);
    wait_connected(&session).await;

    session
        .publish("iot/p/d/properties/write", Bytes::from_static(b"{}"))
        .await
        .unwrap();
    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert!(published[0].packet_id.is_some());

    broker.mute_pubacks(true);
    assert_eq!(
        session
            .publish("iot/p/d/properties/write", Bytes::from_static(b"{}"))
            .await,
        Err(SessionError::Timeout)
    );

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_publish_fails_fast_when_broker_is_down() {
    let (session, _rx) = connect(closed_port().await, &["x"]);

    let result = timeout(
        Duration::from_millis(100),
        session.publish("t", Bytes::from_static(b"1")),
    )
    .await
    .expect("publish must not block while disconnected");
    assert_eq!(result, Err(SessionError::NotConnected));

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_reports_failed_connect_attempts() {
    let port = closed_port().await;
    let (session, _rx) = connect(port, &["x"]);
    let mut events = session.events();

    let event = timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, SessionEvent::ConnectionFailed(_)));
    assert_ne!(session.status(), SessionStatus::Connected);

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_close_disconnects_and_stops() {
    let broker = FakeBroker::start().await;
    let (session, _rx) = connect(broker.port(), &["x"]);
    wait_connected(&session).await;
    assert_eq!(broker.client_count(), 1);

    session.close().await.unwrap();

    assert_eq!(session.status(), SessionStatus::Closed);
    broker.wait_for_clients(0).await;
    assert_eq!(
        session.publish("t", Bytes::from_static(b"1")).await,
        Err(SessionError::Closed)
    );
    // Idempotent
    session.close().await.unwrap();
    assert_eq!(broker.connects().len(), 1);
}

#[tokio::test]
async fn test_stalled_handler_does_not_block_connection() {
    let broker = FakeBroker::start().await;
    let gate = Arc::new(Semaphore::new(0));
    let (handled, mut rx) = mpsc::unbounded_channel();
    let session = BrokerSession::connect(
        endpoint(broker.port(), Some("secret")),
        SessionOptions {
            inbound_capacity: 1,
            ..options()
        },
        vec!["tele/#".to_string()],
        Arc::new(StalledHandler {
            gate: gate.clone(),
            handled,
        }),
    );
    wait_connected(&session).await;

    for _ in 0..5 {
        broker.inject("tele/meter/power", b"450");
    }
    let first = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.payload, Bytes::from_static(b"450"));

    // The handler is stuck on the first message, the queue holds one more
    // and the rest are dropped; the link itself keeps working
    session
        .publish("iot/p/d/properties/write", Bytes::from_static(b"{}"))
        .await
        .unwrap();
    assert_eq!(session.status(), SessionStatus::Connected);
    assert_eq!(broker.connects().len(), 1);

    gate.close();
    let mut delivered = 1;
    while timeout(Duration::from_millis(200), rx.recv()).await.is_ok() {
        delivered += 1;
    }
    assert!(delivered <= 2);

    session.close().await.unwrap();
}
