//! MQTT Packet Encoder
//!
//! Every packet is encoded in two phases: the exact body size is computed
//! from the fields first, then the fixed header and body are written. A
//! packet that cannot be encoded leaves the output buffer untouched.

use bytes::{BufMut, BytesMut};

use super::{
    remaining_length_len, write_binary, write_remaining_length, write_string,
    MAX_REMAINING_LENGTH, MAX_STRING_LEN,
};
use crate::protocol::{
    ConnAck, Connect, EncodeError, Packet, Publish, QoS, SubAck, Subscribe, Unsubscribe,
};

/// MQTT Packet Encoder
#[derive(Debug, Clone, Copy, Default)]
pub struct Encoder;

/// Size of a length-prefixed field, rejecting oversize content up front
#[inline]
fn prefixed_len(len: usize) -> Result<usize, EncodeError> {
    if len > MAX_STRING_LEN {
        return Err(EncodeError::StringTooLong);
    }
    Ok(2 + len)
}

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Exact size `packet` occupies on the wire
    pub fn encoded_len(&self, packet: &Packet) -> Result<usize, EncodeError> {
        let body = body_len(packet)?;
        if body > MAX_REMAINING_LENGTH {
            return Err(EncodeError::RemainingLengthOverflow(body));
        }
        Ok(1 + remaining_length_len(body) + body)
    }

    /// Encode a packet to the buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let remaining_length = body_len(packet)?;
        if remaining_length > MAX_REMAINING_LENGTH {
            return Err(EncodeError::RemainingLengthOverflow(remaining_length));
        }

        buf.reserve(1 + remaining_length_len(remaining_length) + remaining_length);
        buf.put_u8(first_byte(packet));
        write_remaining_length(buf, remaining_length)?;

        match packet {
            Packet::Connect(p) => encode_connect(p, buf),
            Packet::ConnAck(p) => {
                encode_connack(p, buf);
                Ok(())
            }
            Packet::Publish(p) => encode_publish(p, buf),
            Packet::PubAck(p) => {
                buf.put_u16(p.packet_id);
                Ok(())
            }
            Packet::PubRec(p) => {
                buf.put_u16(p.packet_id);
                Ok(())
            }
            Packet::PubRel(p) => {
                buf.put_u16(p.packet_id);
                Ok(())
            }
            Packet::PubComp(p) => {
                buf.put_u16(p.packet_id);
                Ok(())
            }
            Packet::UnsubAck(p) => {
                buf.put_u16(p.packet_id);
                Ok(())
            }
            Packet::Subscribe(p) => encode_subscribe(p, buf),
            Packet::SubAck(p) => {
                encode_suback(p, buf);
                Ok(())
            }
            Packet::Unsubscribe(p) => encode_unsubscribe(p, buf),
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => Ok(()),
        }
    }
}

fn first_byte(packet: &Packet) -> u8 {
    let packet_type = packet.packet_type();
    let flags = match packet {
        Packet::Publish(p) => {
            let mut flags = (p.qos as u8) << 1;
            if p.dup {
                flags |= 0x08;
            }
            if p.retain {
                flags |= 0x01;
            }
            flags
        }
        _ => packet_type.fixed_flags(),
    };
    ((packet_type as u8) << 4) | flags
}

/// Phase one: exact remaining length from the packet's fields
fn body_len(packet: &Packet) -> Result<usize, EncodeError> {
    let len = match packet {
        Packet::Connect(p) => connect_len(p)?,
        Packet::ConnAck(_) => 2,
        Packet::Publish(p) => publish_len(p)?,
        Packet::PubAck(_)
        | Packet::PubRec(_)
        | Packet::PubRel(_)
        | Packet::PubComp(_)
        | Packet::UnsubAck(_) => 2,
        Packet::Subscribe(p) => {
            if p.subscriptions.is_empty() {
                return Err(EncodeError::EmptyTopicList);
            }
            let mut len = 2;
            for sub in &p.subscriptions {
                len += prefixed_len(sub.filter.len())? + 1;
            }
            len
        }
        Packet::SubAck(p) => 2 + p.return_codes.len(),
        Packet::Unsubscribe(p) => {
            if p.filters.is_empty() {
                return Err(EncodeError::EmptyTopicList);
            }
            let mut len = 2;
            for filter in &p.filters {
                len += prefixed_len(filter.len())?;
            }
            len
        }
        Packet::PingReq | Packet::PingResp | Packet::Disconnect => 0,
    };
    Ok(len)
}

fn connect_len(packet: &Connect) -> Result<usize, EncodeError> {
    // protocol name + level + flags + keep alive
    let mut len = prefixed_len(packet.protocol_version.protocol_name().len())? + 1 + 1 + 2;
    len += prefixed_len(packet.client_id.len())?;

    if let Some(ref will) = packet.will {
        len += prefixed_len(will.topic.len())?;
        len += prefixed_len(will.payload.len())?;
    }
    if let Some(ref username) = packet.username {
        len += prefixed_len(username.len())?;
    }
    if let Some(ref password) = packet.password {
        len += prefixed_len(password.len())?;
    }
    Ok(len)
}

fn publish_len(packet: &Publish) -> Result<usize, EncodeError> {
    let mut len = prefixed_len(packet.topic.len())?;
    if packet.qos != QoS::AtMostOnce {
        if packet.packet_id.is_none() {
            return Err(EncodeError::MissingPacketId);
        }
        len += 2;
    }
    Ok(len + packet.payload.len())
}

fn encode_connect(packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
    write_string(buf, packet.protocol_version.protocol_name())?;
    buf.put_u8(packet.protocol_version as u8);

    let mut flags: u8 = 0;
    if packet.clean_session {
        flags |= 0x02;
    }
    if let Some(ref will) = packet.will {
        flags |= 0x04;
        flags |= (will.qos as u8) << 3;
        if will.retain {
            flags |= 0x20;
        }
    }
    if packet.password.is_some() {
        flags |= 0x40;
    }
    if packet.username.is_some() {
        flags |= 0x80;
    }
    buf.put_u8(flags);
    buf.put_u16(packet.keep_alive);

    write_string(buf, &packet.client_id)?;

    if let Some(ref will) = packet.will {
        write_string(buf, &will.topic)?;
        write_binary(buf, &will.payload)?;
    }
    if let Some(ref username) = packet.username {
        write_string(buf, username)?;
    }
    if let Some(ref password) = packet.password {
        write_binary(buf, password)?;
    }
    Ok(())
}

fn encode_connack(packet: &ConnAck, buf: &mut BytesMut) {
    buf.put_u8(u8::from(packet.session_present));
    buf.put_u8(packet.return_code as u8);
}

fn encode_publish(packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
    write_string(buf, &packet.topic)?;
    if packet.qos != QoS::AtMostOnce {
        let packet_id = packet.packet_id.ok_or(EncodeError::MissingPacketId)?;
        buf.put_u16(packet_id);
    }
    buf.put_slice(&packet.payload);
    Ok(())
}

fn encode_subscribe(packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u16(packet.packet_id);
    for sub in &packet.subscriptions {
        write_string(buf, &sub.filter)?;
        buf.put_u8(sub.qos as u8);
    }
    Ok(())
}

fn encode_suback(packet: &SubAck, buf: &mut BytesMut) {
    buf.put_u16(packet.packet_id);
    for code in &packet.return_codes {
        buf.put_u8(*code as u8);
    }
}

fn encode_unsubscribe(packet: &Unsubscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u16(packet.packet_id);
    for filter in &packet.filters {
        write_string(buf, filter)?;
    }
    Ok(())
}
