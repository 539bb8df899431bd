//! Packet framing over a split TCP stream

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::SessionError;
use crate::codec::{Decoder, Encoder};
use crate::protocol::Packet;

const READ_BUFFER_SIZE: usize = 4096;

/// Read side: accumulates bytes until a whole packet decodes
pub(super) struct PacketReader {
    half: OwnedReadHalf,
    buf: BytesMut,
    decoder: Decoder,
}

/// Write side: encodes one packet at a time
pub(super) struct PacketWriter {
    half: OwnedWriteHalf,
    buf: BytesMut,
    encoder: Encoder,
}

pub(super) fn split(stream: TcpStream, max_packet_size: usize) -> (PacketReader, PacketWriter) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    (
        PacketReader {
            half: read_half,
            buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            decoder: Decoder::new().with_max_packet_size(max_packet_size),
        },
        PacketWriter {
            half: write_half,
            buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            encoder: Encoder::new(),
        },
    )
}

impl PacketReader {
    /// Next packet from the stream.
    ///
    /// Cancel safe: bytes already read stay buffered for the next call.
    pub(super) async fn recv(&mut self) -> Result<Packet, SessionError> {
        loop {
            if let Some(packet) = self
                .decoder
                .decode(&mut self.buf)
                .map_err(|e| SessionError::Protocol(e.to_string()))?
            {
                return Ok(packet);
            }

            self.buf.reserve(READ_BUFFER_SIZE);
            let n = self.half.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(SessionError::ConnectionLost(
                    "Connection closed by broker".to_string(),
                ));
            }
        }
    }
}

impl PacketWriter {
    pub(super) async fn send(&mut self, packet: &Packet) -> Result<(), SessionError> {
        self.buf.clear();
        self.encoder
            .encode(packet, &mut self.buf)
            .map_err(|e| SessionError::Protocol(format!("Encode error: {}", e)))?;
        self.half.write_all(&self.buf).await?;
        Ok(())
    }

    pub(super) async fn shutdown(&mut self) {
        let _ = self.half.shutdown().await;
    }
}
