//! In-process MQTT broker for integration tests
//!
//! Speaks just enough MQTT v3.1.1 (through the crate's own codec) to accept
//! a session, record what it sends, acknowledge it and push messages back.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use solarflow_bridge::codec::{Decoder, Encoder};
use solarflow_bridge::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, PubAck, Publish, QoS, SubAck,
};
use solarflow_bridge::topic::topic_matches_filter;

const WAIT: Duration = Duration::from_secs(10);

enum Outbound {
    Packet(Packet),
    Close,
}

struct Client {
    id: usize,
    filters: Vec<String>,
    tx: mpsc::UnboundedSender<Outbound>,
}

#[derive(Default)]
struct Shared {
    connects: Mutex<Vec<Connect>>,
    subscribes: Mutex<Vec<Vec<String>>>,
    published: Mutex<Vec<Publish>>,
    clients: Mutex<Vec<Client>>,
    next_id: AtomicUsize,
    mute_pubacks: AtomicBool,
    reject_connects: AtomicUsize,
}

impl Shared {
    fn remove(&self, id: usize) {
        self.clients.lock().retain(|c| c.id != id);
    }
}

pub struct FakeBroker {
    addr: SocketAddr,
    shared: Arc<Shared>,
    accept: JoinHandle<()>,
}

impl FakeBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared::default());

        let accept = tokio::spawn({
            let shared = shared.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(shared.clone(), id, stream));
                }
            }
        });

        Self {
            addr,
            shared,
            accept,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Refuse the next `n` CONNECTs with "bad user name or password"
    pub fn reject_next_connects(&self, n: usize) {
        self.shared.reject_connects.store(n, Ordering::SeqCst);
    }

    /// Stop acknowledging QoS 1 publishes
    pub fn mute_pubacks(&self, mute: bool) {
        self.shared.mute_pubacks.store(mute, Ordering::SeqCst);
    }

    pub fn connects(&self) -> Vec<Connect> {
        self.shared.connects.lock().clone()
    }

    pub fn subscribes(&self) -> Vec<Vec<String>> {
        self.shared.subscribes.lock().clone()
    }

    pub fn published(&self) -> Vec<Publish> {
        self.shared.published.lock().clone()
    }

    pub fn client_count(&self) -> usize {
        self.shared.clients.lock().len()
    }

    /// Deliver a message to every client subscribed to `topic`
    pub fn inject(&self, topic: &str, payload: &'static [u8]) -> usize {
        let clients = self.shared.clients.lock();
        let mut delivered = 0;
        for client in clients.iter() {
            if client.filters.iter().any(|f| topic_matches_filter(topic, f)) {
                let publish = Publish::new(topic, Bytes::from_static(payload), QoS::AtMostOnce, None);
                if client.tx.send(Outbound::Packet(Packet::Publish(publish))).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Drop every client connection
    pub fn kick_all(&self) {
        for client in self.shared.clients.lock().drain(..) {
            let _ = client.tx.send(Outbound::Close);
        }
    }

    pub async fn wait_for_connects(&self, n: usize) {
        wait_until(|| self.shared.connects.lock().len() >= n, "connects").await;
    }

    pub async fn wait_for_subscribes(&self, n: usize) {
        wait_until(|| self.shared.subscribes.lock().len() >= n, "subscribes").await;
    }

    pub async fn wait_for_published(&self, n: usize) {
        wait_until(|| self.shared.published.lock().len() >= n, "publishes").await;
    }

    pub async fn wait_for_clients(&self, n: usize) {
        wait_until(|| self.client_count() == n, "client count").await;
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.accept.abort();
        self.kick_all();
    }
}

/// Poll `condition` until it holds, panicking after a generous timeout
pub async fn wait_until(condition: impl Fn() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A port with nothing listening on it
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn serve(shared: Arc<Shared>, id: usize, stream: TcpStream) {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let decoder = Decoder::new();
    let mut encoder = Encoder::new();
    let mut buf = BytesMut::with_capacity(4096);

    'conn: loop {
        loop {
            let packet = match decoder.decode(&mut buf) {
                Ok(Some(packet)) => packet,
                Ok(None) => break,
                Err(_) => break 'conn,
            };

            let reply = match packet {
                Packet::Connect(connect) => {
                    let rejected = shared
                        .reject_connects
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok();
                    shared.connects.lock().push(*connect);
                    let return_code = if rejected {
                        ConnectReturnCode::BadUserNameOrPassword
                    } else {
                        shared.clients.lock().push(Client {
                            id,
                            filters: Vec::new(),
                            tx: tx.clone(),
                        });
                        ConnectReturnCode::Accepted
                    };
                    let ack = Packet::ConnAck(ConnAck {
                        session_present: false,
                        return_code,
                    });
                    if send(&mut writer, &mut encoder, &ack).await.is_err() || rejected {
                        break 'conn;
                    }
                    None
                }
                Packet::Subscribe(subscribe) => {
                    let filters: Vec<String> = subscribe
                        .subscriptions
                        .iter()
                        .map(|s| s.filter.clone())
                        .collect();
                    // Routable before the subscribe becomes visible to waiters
                    if let Some(client) = shared.clients.lock().iter_mut().find(|c| c.id == id) {
                        client.filters.extend(filters.iter().cloned());
                    }
                    shared.subscribes.lock().push(filters);
                    Some(Packet::SubAck(SubAck {
                        packet_id: subscribe.packet_id,
                        granted: subscribe
                            .subscriptions
                            .iter()
                            .map(|s| Some(std::cmp::min(s.qos, QoS::AtLeastOnce)))
                            .collect(),
                    }))
                }
                Packet::Publish(publish) => {
                    let ack = match publish.packet_id {
                        Some(packet_id) if !shared.mute_pubacks.load(Ordering::SeqCst) => {
                            Some(Packet::PubAck(PubAck { packet_id }))
                        }
                        _ => None,
                    };
                    shared.published.lock().push(publish);
                    ack
                }
                Packet::PingReq => Some(Packet::PingResp),
                Packet::Disconnect => break 'conn,
                _ => None,
            };

            if let Some(reply) = reply {
                if send(&mut writer, &mut encoder, &reply).await.is_err() {
                    break 'conn;
                }
            }
        }

        tokio::select! {
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            },
            out = rx.recv() => match out {
                Some(Outbound::Packet(packet)) => {
                    if send(&mut writer, &mut encoder, &packet).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close) | None => break,
            },
        }
    }

    shared.remove(id);
    let _ = writer.shutdown().await;
}

async fn send(
    writer: &mut OwnedWriteHalf,
    encoder: &mut Encoder,
    packet: &Packet,
) -> std::io::Result<()> {
    let mut out = BytesMut::new();
    encoder
        .encode(packet, &mut out)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    writer.write_all(&out).await
}
