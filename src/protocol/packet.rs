//! MQTT Packet Definitions

use std::sync::Arc;

use bytes::Bytes;

use super::{ConnectReturnCode, PacketType, QoS};

/// Parsed fixed header: type nibble, flag nibble and declared remaining length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    pub remaining_length: u32,
    /// Size of the fixed header itself (1 type byte + 1..=4 length bytes)
    pub header_len: usize,
}

impl FixedHeader {
    /// Total size of the frame this header introduces
    pub fn frame_len(&self) -> usize {
        self.header_len + self.remaining_length as usize
    }
}

/// MQTT Packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }
}

/// CONNECT packet (client -> server)
///
/// Carries the client's identity. Connect flags are read but not interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Protocol level (always [`super::PROTOCOL_LEVEL`] once decoded)
    pub protocol_level: u8,
    /// Connect flags byte, kept for logging only
    pub flags: u8,
    /// Keep alive interval in seconds (0 = disabled)
    pub keep_alive: u16,
    /// Client identifier
    pub client_id: String,
}

impl Default for Connect {
    fn default() -> Self {
        Self {
            protocol_level: super::PROTOCOL_LEVEL,
            flags: 0x02,
            keep_alive: 60,
            client_id: String::new(),
        }
    }
}

/// CONNACK packet (server -> client)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnAck {
    /// Session present flag (always false, there are no stored sessions)
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

impl ConnAck {
    pub fn new(return_code: ConnectReturnCode) -> Self {
        Self {
            session_present: false,
            return_code,
        }
    }
}

/// PUBLISH packet (bidirectional, QoS 0 only)
///
/// The topic uses `Arc<str>` so fan-out to many subscribers clones cheaply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: Arc<str>,
    pub payload: Bytes,
}

impl Publish {
    pub fn new(topic: impl Into<Arc<str>>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// A single topic filter entry of a SUBSCRIBE or UNSUBSCRIBE payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRequest {
    pub filter: String,
    /// Requested QoS byte as sent by the client (not enforced)
    pub requested_qos: u8,
}

impl TopicRequest {
    pub fn new(filter: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            requested_qos: 0,
        }
    }
}

/// SUBSCRIBE packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub topics: Vec<TopicRequest>,
}

/// SUBACK packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    /// One granted QoS per processed topic, in request order
    pub granted: Vec<QoS>,
}

/// UNSUBSCRIBE packet (client -> server)
///
/// Each entry carries a trailing "QoS" byte on the wire, mirroring SUBSCRIBE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub topics: Vec<TopicRequest>,
}

/// UNSUBACK packet (server -> client)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubAck {
    pub packet_id: u16,
}
