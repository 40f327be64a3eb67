//! MQTT Packet Decoder

use std::sync::Arc;

use bytes::Bytes;

use super::{read_binary, read_remaining_length, read_string, read_u16, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, PacketType, ProtocolVersion, PubAck,
    PubComp, PubRec, PubRel, Publish, QoS, SubAck, SubAckReturnCode, Subscribe, Subscription,
    UnsubAck, Unsubscribe, Will,
};

/// MQTT Packet Decoder
#[derive(Debug, Clone)]
pub struct Decoder {
    /// Largest remaining length accepted
    max_packet_size: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    /// Decode one packet from the front of `buf`.
    ///
    /// Returns `Ok(None)` without consuming anything when the fixed header or
    /// the declared body is not yet complete. The body is only parsed once the
    /// whole frame is available, so any shortfall inside it is malformed.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        let Some(&first_byte) = buf.first() else {
            return Ok(None);
        };

        let packet_type = PacketType::from_u8(first_byte >> 4)
            .ok_or(DecodeError::InvalidPacketType(first_byte >> 4))?;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_remaining_length(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        if remaining_length > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length;
        if buf.len() < total_len {
            return Ok(None);
        }

        if packet_type != PacketType::Publish && flags != packet_type.fixed_flags() {
            return Err(DecodeError::ProtocolViolation("invalid fixed header flags"));
        }

        let body = &buf[1 + len_bytes..total_len];

        let packet = match packet_type {
            PacketType::Connect => self.decode_connect(body)?,
            PacketType::ConnAck => decode_connack(body)?,
            PacketType::Publish => decode_publish(flags, body)?,
            PacketType::PubAck => Packet::PubAck(PubAck::new(decode_packet_id_only(body)?)),
            PacketType::PubRec => Packet::PubRec(PubRec::new(decode_packet_id_only(body)?)),
            PacketType::PubRel => Packet::PubRel(PubRel::new(decode_packet_id_only(body)?)),
            PacketType::PubComp => Packet::PubComp(PubComp::new(decode_packet_id_only(body)?)),
            PacketType::Subscribe => decode_subscribe(body)?,
            PacketType::SubAck => decode_suback(body)?,
            PacketType::Unsubscribe => decode_unsubscribe(body)?,
            PacketType::UnsubAck => Packet::UnsubAck(UnsubAck::new(decode_packet_id_only(body)?)),
            PacketType::PingReq => {
                expect_empty(body)?;
                Packet::PingReq
            }
            PacketType::PingResp => {
                expect_empty(body)?;
                Packet::PingResp
            }
            PacketType::Disconnect => {
                expect_empty(body)?;
                Packet::Disconnect
            }
        };

        Ok(Some((packet, total_len)))
    }

    /// Decode every complete packet at the front of `buf`.
    ///
    /// Returns the packets plus the number of bytes they occupied; trailing
    /// bytes of an incomplete packet are left for the next call.
    pub fn decode_all(&mut self, buf: &[u8]) -> Result<(Vec<Packet>, usize), DecodeError> {
        let mut packets = Vec::new();
        let mut consumed = 0;

        while let Some((packet, len)) = self.decode(&buf[consumed..])? {
            packets.push(packet);
            consumed += len;
        }

        Ok((packets, consumed))
    }

    fn decode_connect(&mut self, body: &[u8]) -> Result<Packet, DecodeError> {
        let mut pos = 0;

        let (protocol_name, len) = read_string(body)?;
        pos += len;

        let level = *body
            .get(pos)
            .ok_or(DecodeError::MalformedPacket("missing protocol level"))?;
        pos += 1;

        let protocol_version = match (protocol_name, level) {
            ("MQIsdp", 3) => ProtocolVersion::V31,
            ("MQTT", 4) => ProtocolVersion::V311,
            ("MQIsdp", _) | ("MQTT", _) => {
                return Err(DecodeError::InvalidProtocolVersion(level))
            }
            _ => return Err(DecodeError::InvalidProtocolName),
        };

        let flags = *body
            .get(pos)
            .ok_or(DecodeError::MalformedPacket("missing connect flags"))?;
        pos += 1;

        if flags & 0x01 != 0 {
            return Err(DecodeError::ProtocolViolation("reserved connect flag set"));
        }

        let clean_session = flags & 0x02 != 0;
        let will_flag = flags & 0x04 != 0;
        let will_qos_bits = (flags >> 3) & 0x03;
        let will_retain = flags & 0x20 != 0;
        let password_flag = flags & 0x40 != 0;
        let username_flag = flags & 0x80 != 0;

        if !will_flag && (will_qos_bits != 0 || will_retain) {
            return Err(DecodeError::ProtocolViolation(
                "will QoS or retain set without will flag",
            ));
        }
        if password_flag && !username_flag {
            return Err(DecodeError::ProtocolViolation(
                "password flag set without username flag",
            ));
        }
        let will_qos = QoS::from_u8(will_qos_bits).ok_or(DecodeError::InvalidQoS(will_qos_bits))?;

        let keep_alive = read_u16(&body[pos..])?;
        pos += 2;

        let (client_id, len) = read_string(&body[pos..])?;
        let client_id = client_id.to_string();
        pos += len;

        let will = if will_flag {
            let (topic, len) = read_string(&body[pos..])?;
            let topic = topic.to_string();
            pos += len;

            let (payload, len) = read_binary(&body[pos..])?;
            let payload = Bytes::copy_from_slice(payload);
            pos += len;

            Some(Will {
                topic,
                payload,
                qos: will_qos,
                retain: will_retain,
            })
        } else {
            None
        };

        let username = if username_flag {
            let (username, len) = read_string(&body[pos..])?;
            pos += len;
            Some(username.to_string())
        } else {
            None
        };

        let password = if password_flag {
            let (password, len) = read_binary(&body[pos..])?;
            pos += len;
            Some(Bytes::copy_from_slice(password))
        } else {
            None
        };

        if pos != body.len() {
            return Err(DecodeError::MalformedPacket("trailing bytes in CONNECT"));
        }

        Ok(Packet::Connect(Box::new(Connect {
            protocol_version,
            client_id,
            clean_session,
            keep_alive,
            username,
            password,
            will,
        })))
    }
}

fn expect_empty(body: &[u8]) -> Result<(), DecodeError> {
    if body.is_empty() {
        Ok(())
    } else {
        Err(DecodeError::MalformedPacket("unexpected packet body"))
    }
}

fn decode_packet_id_only(body: &[u8]) -> Result<u16, DecodeError> {
    if body.len() != 2 {
        return Err(DecodeError::MalformedPacket(
            "expected exactly a packet identifier",
        ));
    }
    read_u16(body)
}

fn decode_connack(body: &[u8]) -> Result<Packet, DecodeError> {
    let [ack_flags, code] = body else {
        return Err(DecodeError::MalformedPacket("CONNACK must be 2 bytes"));
    };

    if ack_flags & 0xFE != 0 {
        return Err(DecodeError::ProtocolViolation(
            "reserved connack flags set",
        ));
    }

    let return_code =
        ConnectReturnCode::from_u8(*code).ok_or(DecodeError::InvalidReturnCode(*code))?;

    Ok(Packet::ConnAck(ConnAck {
        session_present: ack_flags & 0x01 != 0,
        return_code,
    }))
}

fn decode_publish(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    let dup = flags & 0x08 != 0;
    let qos_bits = (flags >> 1) & 0x03;
    let retain = flags & 0x01 != 0;

    let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
    if dup && qos == QoS::AtMostOnce {
        return Err(DecodeError::ProtocolViolation("DUP flag set on QoS 0 publish"));
    }

    let mut pos = 0;
    let (topic, len) = read_string(body)?;
    let topic: Arc<str> = Arc::from(topic);
    pos += len;

    let packet_id = if qos != QoS::AtMostOnce {
        let id = read_u16(&body[pos..])?;
        pos += 2;
        if id == 0 {
            return Err(DecodeError::ProtocolViolation("packet identifier is zero"));
        }
        Some(id)
    } else {
        None
    };

    let payload = Bytes::copy_from_slice(&body[pos..]);

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        payload,
    }))
}

fn decode_subscribe(body: &[u8]) -> Result<Packet, DecodeError> {
    let packet_id = read_u16(body)?;
    let mut pos = 2;
    let mut subscriptions = Vec::new();

    while pos < body.len() {
        let (filter, len) = read_string(&body[pos..])?;
        let filter = filter.to_string();
        pos += len;

        let qos_byte = *body
            .get(pos)
            .ok_or(DecodeError::MalformedPacket("missing requested QoS"))?;
        pos += 1;

        if qos_byte & 0xFC != 0 {
            return Err(DecodeError::MalformedPacket(
                "reserved bits set in requested QoS",
            ));
        }
        let qos = QoS::from_u8(qos_byte).ok_or(DecodeError::InvalidQoS(qos_byte))?;

        subscriptions.push(Subscription { filter, qos });
    }

    if subscriptions.is_empty() {
        return Err(DecodeError::ProtocolViolation(
            "SUBSCRIBE with no topic filters",
        ));
    }

    Ok(Packet::Subscribe(Subscribe {
        packet_id,
        subscriptions,
    }))
}

fn decode_suback(body: &[u8]) -> Result<Packet, DecodeError> {
    let packet_id = read_u16(body)?;
    let return_codes = body[2..]
        .iter()
        .map(|&code| SubAckReturnCode::from_u8(code).ok_or(DecodeError::InvalidReturnCode(code)))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Packet::SubAck(SubAck {
        packet_id,
        return_codes,
    }))
}

fn decode_unsubscribe(body: &[u8]) -> Result<Packet, DecodeError> {
    let packet_id = read_u16(body)?;
    let mut pos = 2;
    let mut filters = Vec::new();

    while pos < body.len() {
        let (filter, len) = read_string(&body[pos..])?;
        filters.push(filter.to_string());
        pos += len;
    }

    if filters.is_empty() {
        return Err(DecodeError::ProtocolViolation(
            "UNSUBSCRIBE with no topic filters",
        ));
    }

    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
}
