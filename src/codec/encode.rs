//! MQTT Packet Encoder

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int};
use crate::protocol::{
    ConnAck, Connect, EncodeError, Packet, PubAck, Publish, QoS, SubAck, Subscribe,
    PROTOCOL_LEVEL_V311,
};

/// MQTT v3.1.1 packet encoder
///
/// Each packet body is assembled in a scratch buffer first so the fixed
/// header can carry the exact remaining length.
#[derive(Debug, Default)]
pub struct Encoder {
    scratch: BytesMut,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode a packet, appending it to `buf`
    pub fn encode(&mut self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        self.scratch.clear();
        let first_byte = match packet {
            Packet::Connect(p) => self.body_connect(p)?,
            Packet::ConnAck(p) => self.body_connack(p),
            Packet::Publish(p) => self.body_publish(p)?,
            Packet::PubAck(p) => self.body_puback(p),
            Packet::Subscribe(p) => self.body_subscribe(p)?,
            Packet::SubAck(p) => self.body_suback(p),
            Packet::PingReq => 0xC0,
            Packet::PingResp => 0xD0,
            Packet::Disconnect => 0xE0,
        };

        buf.put_u8(first_byte);
        write_variable_int(buf, self.scratch.len())?;
        buf.put_slice(&self.scratch);
        Ok(())
    }

    fn body_connect(&mut self, packet: &Connect) -> Result<u8, EncodeError> {
        let body = &mut self.scratch;
        write_string(body, "MQTT")?;
        body.put_u8(PROTOCOL_LEVEL_V311);

        let mut flags: u8 = 0;
        if packet.clean_session {
            flags |= 0x02;
        }
        if packet.password.is_some() {
            flags |= 0x40;
        }
        if packet.username.is_some() {
            flags |= 0x80;
        }
        body.put_u8(flags);
        body.put_u16(packet.keep_alive);

        write_string(body, &packet.client_id)?;
        if let Some(ref username) = packet.username {
            write_string(body, username)?;
        }
        if let Some(ref password) = packet.password {
            write_binary(body, password)?;
        }
        Ok(0x10)
    }

    fn body_connack(&mut self, packet: &ConnAck) -> u8 {
        self.scratch.put_u8(packet.session_present as u8);
        self.scratch.put_u8(packet.return_code as u8);
        0x20
    }

    fn body_publish(&mut self, packet: &Publish) -> Result<u8, EncodeError> {
        let body = &mut self.scratch;
        write_string(body, &packet.topic)?;
        if packet.qos != QoS::AtMostOnce {
            let packet_id = packet.packet_id.ok_or(EncodeError::MissingPacketId)?;
            body.put_u16(packet_id);
        }
        body.put_slice(&packet.payload);

        let mut first_byte: u8 = 0x30;
        if packet.dup {
            first_byte |= 0x08;
        }
        first_byte |= (packet.qos as u8) << 1;
        if packet.retain {
            first_byte |= 0x01;
        }
        Ok(first_byte)
    }

    fn body_puback(&mut self, packet: &PubAck) -> u8 {
        self.scratch.put_u16(packet.packet_id);
        0x40
    }

    fn body_subscribe(&mut self, packet: &Subscribe) -> Result<u8, EncodeError> {
        let body = &mut self.scratch;
        body.put_u16(packet.packet_id);
        for subscription in &packet.subscriptions {
            write_string(body, &subscription.filter)?;
            body.put_u8(subscription.qos as u8);
        }
        // SUBSCRIBE fixed header flags are reserved as 0010
        Ok(0x82)
    }

    fn body_suback(&mut self, packet: &SubAck) -> u8 {
        self.scratch.put_u16(packet.packet_id);
        for granted in &packet.granted {
            self.scratch.put_u8(granted.map(|qos| qos as u8).unwrap_or(0x80));
        }
        0x90
    }
}
