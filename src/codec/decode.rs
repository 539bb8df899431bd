//! MQTT Packet Decoder

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};

use super::{read_variable_int, Reader, DEFAULT_MAX_PACKET_SIZE, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, PacketType, PubAck, Publish, QoS,
    SubAck, Subscribe, Subscription, PROTOCOL_LEVEL_V311,
};

/// MQTT v3.1.1 packet decoder
#[derive(Debug)]
pub struct Decoder {
    /// Maximum accepted remaining length
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    /// Decode one packet from the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched while the packet is
    /// incomplete. On success the packet's bytes are consumed.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Packet>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let flags = first_byte & 0x0F;
        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };
        let remaining_length = remaining_length as usize;

        if remaining_length > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let header_len = 1 + len_bytes;
        if buf.len() < header_len + remaining_length {
            return Ok(None);
        }

        buf.advance(header_len);
        let body = buf.split_to(remaining_length).freeze();

        let packet_type = PacketType::from_u8(first_byte >> 4)
            .ok_or(DecodeError::InvalidPacketType(first_byte >> 4))?;

        let packet = match packet_type {
            PacketType::Connect => decode_connect(flags, &body)?,
            PacketType::ConnAck => decode_connack(flags, &body)?,
            PacketType::Publish => decode_publish(flags, &body)?,
            PacketType::PubAck => decode_puback(flags, &body)?,
            PacketType::Subscribe => decode_subscribe(flags, &body)?,
            PacketType::SubAck => decode_suback(flags, &body)?,
            PacketType::PingReq => expect_empty(flags, &body, Packet::PingReq)?,
            PacketType::PingResp => expect_empty(flags, &body, Packet::PingResp)?,
            PacketType::Disconnect => expect_empty(flags, &body, Packet::Disconnect)?,
            other => return Err(DecodeError::InvalidPacketType(other as u8)),
        };

        Ok(Some(packet))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn expect_empty(flags: u8, body: &[u8], packet: Packet) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if !body.is_empty() {
        return Err(DecodeError::MalformedPacket("unexpected payload"));
    }
    Ok(packet)
}

fn decode_connect(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    let mut reader = Reader::new(body);

    if reader.string()? != "MQTT" {
        return Err(DecodeError::MalformedPacket("unsupported protocol name"));
    }
    if reader.u8()? != PROTOCOL_LEVEL_V311 {
        return Err(DecodeError::MalformedPacket("unsupported protocol level"));
    }

    let connect_flags = reader.u8()?;
    if connect_flags & 0x01 != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if connect_flags & 0x04 != 0 {
        return Err(DecodeError::MalformedPacket("will messages are not supported"));
    }
    let keep_alive = reader.u16()?;
    let client_id = reader.string()?.to_string();

    let username = if connect_flags & 0x80 != 0 {
        Some(reader.string()?.to_string())
    } else {
        None
    };
    let password = if connect_flags & 0x40 != 0 {
        Some(Bytes::copy_from_slice(reader.binary()?))
    } else {
        None
    };

    Ok(Packet::Connect(Box::new(Connect {
        client_id,
        clean_session: connect_flags & 0x02 != 0,
        keep_alive,
        username,
        password,
    })))
}

fn decode_connack(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    let mut reader = Reader::new(body);
    let acknowledge_flags = reader.u8()?;
    if acknowledge_flags & 0xFE != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    let code = reader.u8()?;
    let return_code = ConnectReturnCode::from_u8(code).ok_or(DecodeError::InvalidReturnCode(code))?;

    Ok(Packet::ConnAck(ConnAck {
        session_present: acknowledge_flags & 0x01 != 0,
        return_code,
    }))
}

fn decode_publish(flags: u8, body: &Bytes) -> Result<Packet, DecodeError> {
    let dup = flags & 0x08 != 0;
    let qos_bits = (flags >> 1) & 0x03;
    let retain = flags & 0x01 != 0;
    let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

    if qos == QoS::AtMostOnce && dup {
        return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
    }

    let mut reader = Reader::new(body);
    let topic = reader.string()?;
    if topic.contains('+') || topic.contains('#') {
        return Err(DecodeError::MalformedPacket("topic contains wildcard"));
    }

    let packet_id = if qos != QoS::AtMostOnce {
        let id = reader.u16()?;
        if id == 0 {
            return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
        }
        Some(id)
    } else {
        None
    };

    let offset = body.len() - reader.remaining();
    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic: Arc::from(topic),
        packet_id,
        payload: body.slice(offset..),
    }))
}

fn decode_puback(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    let mut reader = Reader::new(body);
    Ok(Packet::PubAck(PubAck {
        packet_id: reader.u16()?,
    }))
}

fn decode_subscribe(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0x02 {
        return Err(DecodeError::InvalidFlags);
    }
    let mut reader = Reader::new(body);
    let packet_id = reader.u16()?;

    let mut subscriptions = Vec::new();
    while reader.remaining() > 0 {
        let filter = reader.string()?.to_string();
        let requested = reader.u8()?;
        let qos = QoS::from_u8(requested & 0x03).ok_or(DecodeError::InvalidQoS(requested))?;
        subscriptions.push(Subscription { filter, qos });
    }
    if subscriptions.is_empty() {
        return Err(DecodeError::MalformedPacket("SUBSCRIBE without topic filters"));
    }

    Ok(Packet::Subscribe(Subscribe {
        packet_id,
        subscriptions,
    }))
}

fn decode_suback(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    let mut reader = Reader::new(body);
    let packet_id = reader.u16()?;

    let granted = reader
        .rest()
        .iter()
        .map(|&code| match code {
            0x80 => Ok(None),
            other => QoS::from_u8(other)
                .map(Some)
                .ok_or(DecodeError::InvalidQoS(other)),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Packet::SubAck(SubAck { packet_id, granted }))
}
