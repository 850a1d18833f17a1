//! MQTT Protocol definitions and types
//!
//! Defines the subset of MQTT v3.1.1 the broker speaks: CONNECT/CONNACK,
//! PUBLISH at QoS 0, SUBSCRIBE/UNSUBSCRIBE and their acknowledgements,
//! PINGREQ/PINGRESP and DISCONNECT.

mod error;
mod packet;
mod reason;

pub use error::{DecodeError, EncodeError, ProtocolError};
pub use packet::*;
pub use reason::ConnectReturnCode;

/// Protocol name carried in the CONNECT variable header, length prefix included
pub const PROTOCOL_NAME: [u8; 6] = [0x00, 0x04, b'M', b'Q', b'T', b'T'];

/// The only supported protocol level (MQTT v3.1.1)
pub const PROTOCOL_LEVEL: u8 = 4;

/// Fixed-header flags required on SUBSCRIBE and UNSUBSCRIBE
pub const SUBSCRIBE_FLAGS: u8 = 0b0010;

/// Quality of Service levels
///
/// Only [`QoS::AtMostOnce`] is honoured. Higher levels are accepted in
/// SUBSCRIBE requests but always granted as QoS 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

/// MQTT Packet Type (upper nibble of the first fixed-header byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
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
    Auth = 15,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(PacketType::Connect),
            2 => Some(PacketType::ConnAck),
            3 => Some(PacketType::Publish),
            4 => Some(PacketType::PubAck),
            5 => Some(PacketType::PubRec),
            6 => Some(PacketType::PubRel),
            7 => Some(PacketType::PubComp),
            8 => Some(PacketType::Subscribe),
            9 => Some(PacketType::SubAck),
            10 => Some(PacketType::Unsubscribe),
            11 => Some(PacketType::UnsubAck),
            12 => Some(PacketType::PingReq),
            13 => Some(PacketType::PingResp),
            14 => Some(PacketType::Disconnect),
            15 => Some(PacketType::Auth),
            _ => None,
        }
    }

    /// Fixed-header flags this packet type must carry
    pub fn required_flags(self) -> u8 {
        match self {
            PacketType::Subscribe | PacketType::Unsubscribe => SUBSCRIBE_FLAGS,
            _ => 0,
        }
    }

    /// PINGREQ and DISCONNECT are recognized from the type nibble alone
    pub fn has_body(self) -> bool {
        !matches!(self, PacketType::PingReq | PacketType::Disconnect)
    }
}
