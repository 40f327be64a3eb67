//! Wire-level vocabulary shared by the codec, the subscription engine and
//! the connection handler. Covers the MQTT 3.1 / 3.1.1 packet family only.

mod error;
mod packet;
mod return_code;

pub use error::{DecodeError, EncodeError, ProtocolError};
pub use packet::*;
pub use return_code::{ConnectReturnCode, SubAckReturnCode};

/// Protocol level byte of CONNECT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolVersion {
    /// 3.1, announced as "MQIsdp"
    V31 = 3,
    /// 3.1.1, announced as "MQTT"
    V311 = 4,
}

impl ProtocolVersion {
    pub fn protocol_name(self) -> &'static str {
        match self {
            ProtocolVersion::V31 => "MQIsdp",
            ProtocolVersion::V311 => "MQTT",
        }
    }
}

/// Delivery guarantee. Ordered, so `min`/`max` pick the weaker/stronger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        [QoS::AtMostOnce, QoS::AtLeastOnce, QoS::ExactlyOnce]
            .get(usize::from(v))
            .copied()
    }
}

/// Control packet type, the high nibble of the first byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    const ALL: [PacketType; 14] = [
        PacketType::Connect,
        PacketType::ConnAck,
        PacketType::Publish,
        PacketType::PubAck,
        PacketType::PubRec,
        PacketType::PubRel,
        PacketType::PubComp,
        PacketType::Subscribe,
        PacketType::SubAck,
        PacketType::Unsubscribe,
        PacketType::UnsubAck,
        PacketType::PingReq,
        PacketType::PingResp,
        PacketType::Disconnect,
    ];

    /// 0 and 15 are reserved and yield `None`
    pub fn from_u8(v: u8) -> Option<Self> {
        let index = usize::from(v).checked_sub(1)?;
        Self::ALL.get(index).copied()
    }

    /// Required low nibble; PUBLISH carries its own flags instead
    pub fn fixed_flags(self) -> u8 {
        match self {
            PacketType::PubRel | PacketType::Subscribe | PacketType::Unsubscribe => 0b0010,
            _ => 0,
        }
    }
}
