//! MQTT Packet Decoder
//!
//! Decoding is split in two steps so the broker can size its reads: the
//! fixed header announces how many body bytes to wait for, and the body is
//! decoded once all of them have arrived.

use bytes::Bytes;

use super::{read_string, read_u16, read_variable_int, DEFAULT_MAX_PACKET_SIZE, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, FixedHeader, Packet, PacketType, Publish,
    QoS, SubAck, Subscribe, TopicRequest, UnsubAck, Unsubscribe, PROTOCOL_LEVEL, PROTOCOL_NAME,
};

/// MQTT Packet Decoder
#[derive(Debug, Clone)]
pub struct Decoder {
    /// Largest accepted remaining length
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

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Parse the fixed header at the start of `buf`
    ///
    /// Returns `Ok(None)` while the header is still incomplete. Flag
    /// validation happens here so a bad first byte is rejected before any
    /// body bytes are buffered.
    pub fn decode_header(&self, buf: &[u8]) -> Result<Option<FixedHeader>, DecodeError> {
        if buf.is_empty() {
            return Ok(None);
        }

        let first_byte = buf[0];
        let type_bits = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let packet_type =
            PacketType::from_u8(type_bits).ok_or(DecodeError::InvalidPacketType(type_bits))?;
        if flags != packet_type.required_flags() {
            return Err(DecodeError::InvalidFlags);
        }

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        if !packet_type.has_body() && remaining_length != 0 {
            return Err(DecodeError::MalformedPacket("packet type carries no body"));
        }

        Ok(Some(FixedHeader {
            packet_type,
            flags,
            remaining_length,
            header_len: 1 + len_bytes,
        }))
    }

    /// Decode a body whose length matches `header.remaining_length`
    pub fn decode_body(&self, header: &FixedHeader, body: &[u8]) -> Result<Packet, DecodeError> {
        debug_assert_eq!(body.len(), header.remaining_length as usize);

        match header.packet_type {
            PacketType::Connect => self.decode_connect(body),
            PacketType::ConnAck => self.decode_connack(body),
            PacketType::Publish => self.decode_publish(body),
            PacketType::Subscribe => self.decode_subscribe(body),
            PacketType::SubAck => self.decode_suback(body),
            PacketType::Unsubscribe => self.decode_unsubscribe(body),
            PacketType::UnsubAck => self.decode_unsuback(body),
            PacketType::PingReq => Ok(Packet::PingReq),
            PacketType::PingResp => Ok(Packet::PingResp),
            PacketType::Disconnect => Ok(Packet::Disconnect),
            other => Err(DecodeError::InvalidPacketType(other as u8)),
        }
    }

    /// Decode a packet from the buffer
    /// Returns (packet, bytes_consumed) or error
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        let header = match self.decode_header(buf)? {
            Some(header) => header,
            None => return Ok(None),
        };

        let total_len = header.frame_len();
        if buf.len() < total_len {
            return Ok(None);
        }

        let packet = self.decode_body(&header, &buf[header.header_len..total_len])?;
        Ok(Some((packet, total_len)))
    }

    fn decode_connect(&self, payload: &[u8]) -> Result<Packet, DecodeError> {
        if payload.len() < PROTOCOL_NAME.len() || payload[..PROTOCOL_NAME.len()] != PROTOCOL_NAME {
            return Err(DecodeError::InvalidProtocolName);
        }
        let mut pos = PROTOCOL_NAME.len();

        let protocol_level = *payload
            .get(pos)
            .ok_or(DecodeError::MalformedPacket("missing protocol level"))?;
        if protocol_level != PROTOCOL_LEVEL {
            return Err(DecodeError::InvalidProtocolLevel(protocol_level));
        }
        pos += 1;

        let flags = *payload
            .get(pos)
            .ok_or(DecodeError::MalformedPacket("missing connect flags"))?;
        pos += 1;

        let keep_alive = read_u16(&payload[pos..])
            .map_err(|_| DecodeError::MalformedPacket("missing keep alive"))?;
        pos += 2;

        let (client_id, _) = read_string(&payload[pos..]).map_err(|e| match e {
            DecodeError::InsufficientData => {
                DecodeError::MalformedPacket("client identifier truncated")
            }
            other => other,
        })?;

        // Will, user name and password fields are not interpreted
        Ok(Packet::Connect(Connect {
            protocol_level,
            flags,
            keep_alive,
            client_id: client_id.to_string(),
        }))
    }

    fn decode_connack(&self, payload: &[u8]) -> Result<Packet, DecodeError> {
        if payload.len() != 2 {
            return Err(DecodeError::MalformedPacket("CONNACK must be 2 bytes"));
        }

        let return_code = ConnectReturnCode::from_u8(payload[1])
            .ok_or(DecodeError::MalformedPacket("unknown CONNACK return code"))?;

        Ok(Packet::ConnAck(ConnAck {
            session_present: (payload[0] & 0x01) != 0,
            return_code,
        }))
    }

    fn decode_publish(&self, payload: &[u8]) -> Result<Packet, DecodeError> {
        let topic_len = read_u16(payload)
            .map_err(|_| DecodeError::MalformedPacket("missing topic length"))?
            as usize;

        if payload.len() < 2 + topic_len {
            return Err(DecodeError::MalformedPacket(
                "topic length exceeds remaining length",
            ));
        }

        let topic = std::str::from_utf8(&payload[2..2 + topic_len])
            .map_err(|_| DecodeError::InvalidUtf8)?;

        // QoS 0 carries no packet identifier: everything after the topic is payload
        Ok(Packet::Publish(Publish {
            topic: topic.into(),
            payload: Bytes::copy_from_slice(&payload[2 + topic_len..]),
        }))
    }

    /// Read the packet identifier and topic entries shared by SUBSCRIBE and UNSUBSCRIBE
    fn decode_topic_requests(
        &self,
        payload: &[u8],
    ) -> Result<(u16, Vec<TopicRequest>), DecodeError> {
        let packet_id = read_u16(payload)
            .map_err(|_| DecodeError::MalformedPacket("missing packet identifier"))?;
        let mut pos = 2;

        if pos == payload.len() {
            return Err(DecodeError::EmptyPayload);
        }

        let mut topics = Vec::new();
        while pos < payload.len() {
            let (filter, len) = read_string(&payload[pos..]).map_err(|e| match e {
                DecodeError::InsufficientData => {
                    DecodeError::MalformedPacket("topic filter truncated")
                }
                other => other,
            })?;
            pos += len;

            let requested_qos = *payload
                .get(pos)
                .ok_or(DecodeError::MalformedPacket("missing requested QoS"))?;
            pos += 1;

            topics.push(TopicRequest {
                filter: filter.to_string(),
                requested_qos,
            });
        }

        Ok((packet_id, topics))
    }

    fn decode_subscribe(&self, payload: &[u8]) -> Result<Packet, DecodeError> {
        let (packet_id, topics) = self.decode_topic_requests(payload)?;
        Ok(Packet::Subscribe(Subscribe { packet_id, topics }))
    }

    fn decode_unsubscribe(&self, payload: &[u8]) -> Result<Packet, DecodeError> {
        let (packet_id, topics) = self.decode_topic_requests(payload)?;
        Ok(Packet::Unsubscribe(Unsubscribe { packet_id, topics }))
    }

    fn decode_suback(&self, payload: &[u8]) -> Result<Packet, DecodeError> {
        let packet_id = read_u16(payload)
            .map_err(|_| DecodeError::MalformedPacket("missing packet identifier"))?;

        let granted = payload[2..]
            .iter()
            .map(|&code| {
                QoS::from_u8(code).ok_or(DecodeError::MalformedPacket("invalid granted QoS"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Packet::SubAck(SubAck { packet_id, granted }))
    }

    fn decode_unsuback(&self, payload: &[u8]) -> Result<Packet, DecodeError> {
        if payload.len() != 2 {
            return Err(DecodeError::MalformedPacket("UNSUBACK must be 2 bytes"));
        }
        Ok(Packet::UnsubAck(UnsubAck {
            packet_id: u16::from_be_bytes([payload[0], payload[1]]),
        }))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
