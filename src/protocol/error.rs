//! Protocol error types

use std::fmt;

/// Errors that can occur during packet decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough data in buffer
    InsufficientData,
    /// Remaining length would need a fifth byte
    MalformedLength,
    /// Packet type the broker does not accept
    InvalidPacketType(u8),
    /// Fixed-header flags do not match the packet type
    InvalidFlags,
    /// CONNECT protocol name is not "MQTT"
    InvalidProtocolName,
    /// CONNECT protocol level is not supported
    InvalidProtocolLevel(u8),
    /// Invalid UTF-8 string
    InvalidUtf8,
    /// Body shorter than its own length fields claim
    MalformedPacket(&'static str),
    /// Remaining length exceeds the configured maximum
    PacketTooLarge,
    /// SUBSCRIBE/UNSUBSCRIBE without a single topic
    EmptyPayload,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "insufficient data in buffer"),
            Self::MalformedLength => write!(f, "malformed remaining length"),
            Self::InvalidPacketType(t) => write!(f, "invalid packet type: {}", t),
            Self::InvalidFlags => write!(f, "invalid packet flags"),
            Self::InvalidProtocolName => write!(f, "invalid protocol name"),
            Self::InvalidProtocolLevel(v) => write!(f, "invalid protocol level: {}", v),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 string"),
            Self::MalformedPacket(msg) => write!(f, "malformed packet: {}", msg),
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::EmptyPayload => write!(f, "payload contains no topics"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors that can occur during packet encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Remaining length does not fit the variable-length encoding
    PacketTooLarge,
    /// String longer than a 2-byte length prefix allows
    StringTooLong,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::StringTooLong => write!(f, "string too long"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// High-level protocol errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Decode error
    Decode(DecodeError),
    /// Encode error
    Encode(EncodeError),
    /// Frame arrived out of protocol order
    ProtocolViolation(&'static str),
    /// Client identifier empty or already taken
    IdentifierRejected,
    /// Packet type recognized on the wire but not handled by the broker
    UnsupportedFrameType(u8),
    /// Keep alive timeout
    KeepAliveTimeout,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "decode error: {}", e),
            Self::Encode(e) => write!(f, "encode error: {}", e),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Self::IdentifierRejected => write!(f, "identifier rejected"),
            Self::UnsupportedFrameType(t) => write!(f, "unsupported frame type: {}", t),
            Self::KeepAliveTimeout => write!(f, "keep alive timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

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
