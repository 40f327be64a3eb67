use std::fmt;

/// Why bytes could not be turned into a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The frame is not complete yet; retry with more bytes
    InsufficientData,
    /// Remaining length runs past four bytes
    MalformedLength,
    /// Well-formed but forbidden, e.g. reserved flag bits set
    ProtocolViolation(&'static str),
    /// The frame is complete but its body does not parse
    MalformedPacket(&'static str),
    /// Reserved type nibble (0 or 15)
    InvalidPacketType(u8),
    InvalidProtocolName,
    InvalidProtocolVersion(u8),
    InvalidQoS(u8),
    InvalidUtf8,
    InvalidReturnCode(u8),
    /// Over the configured size limit
    PacketTooLarge,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => f.write_str("incomplete packet"),
            Self::MalformedLength => f.write_str("remaining length longer than four bytes"),
            Self::ProtocolViolation(what) => write!(f, "protocol violation: {}", what),
            Self::MalformedPacket(what) => write!(f, "malformed packet: {}", what),
            Self::InvalidPacketType(t) => write!(f, "reserved packet type {}", t),
            Self::InvalidProtocolName => f.write_str("unknown protocol name"),
            Self::InvalidProtocolVersion(v) => write!(f, "unsupported protocol level {}", v),
            Self::InvalidQoS(q) => write!(f, "QoS {} out of range", q),
            Self::InvalidUtf8 => f.write_str("string is not valid UTF-8"),
            Self::InvalidReturnCode(c) => write!(f, "unknown return code {}", c),
            Self::PacketTooLarge => f.write_str("packet exceeds size limit"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Why a packet could not be serialized
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Body does not fit the four-byte remaining length
    RemainingLengthOverflow(usize),
    /// A length-prefixed field is over 65,535 bytes
    StringTooLong,
    /// SUBSCRIBE or UNSUBSCRIBE without filters
    EmptyTopicList,
    /// QoS 1/2 PUBLISH without a packet identifier
    MissingPacketId,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemainingLengthOverflow(n) => write!(f, "body of {} bytes is too large", n),
            Self::StringTooLong => f.write_str("field longer than 65535 bytes"),
            Self::EmptyTopicList => f.write_str("no topic filters"),
            Self::MissingPacketId => f.write_str("QoS > 0 publish without packet id"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Failures that end a client connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    Decode(DecodeError),
    Encode(EncodeError),
    /// CONNECT refused with this CONNACK return code
    ConnectionRefused(u8),
    ProtocolViolation(&'static str),
    NotAuthorized,
    KeepAliveTimeout,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => e.fmt(f),
            Self::Encode(e) => e.fmt(f),
            Self::ConnectionRefused(code) => write!(f, "CONNECT refused (return code {})", code),
            Self::ProtocolViolation(what) => write!(f, "protocol violation: {}", what),
            Self::NotAuthorized => f.write_str("bad username or password"),
            Self::KeepAliveTimeout => f.write_str("keep-alive expired"),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decode(e) => Some(e),
            Self::Encode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DecodeError> for ProtocolError {
    fn from(e: DecodeError) -> Self {
        ProtocolError::Decode(e)
    }
}

impl From<EncodeError> for ProtocolError {
    fn from(e: EncodeError) -> Self {
        ProtocolError::Encode(e)
    }
}
