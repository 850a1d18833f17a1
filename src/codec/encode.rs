//! MQTT Packet Encoder

use bytes::{BufMut, BytesMut};

use super::{write_string, write_variable_int};
use crate::protocol::{
    ConnAck, Connect, EncodeError, Packet, Publish, SubAck, Subscribe, TopicRequest, UnsubAck,
    Unsubscribe, PROTOCOL_NAME, SUBSCRIBE_FLAGS,
};

/// MQTT Packet Encoder
#[derive(Debug, Clone, Copy, Default)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a packet to the buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(p) => self.encode_connect(p, buf),
            Packet::ConnAck(p) => self.encode_connack(p, buf),
            Packet::Publish(p) => self.encode_publish(p, buf),
            Packet::Subscribe(p) => self.encode_subscribe(p, buf),
            Packet::SubAck(p) => self.encode_suback(p, buf),
            Packet::Unsubscribe(p) => self.encode_unsubscribe(p, buf),
            Packet::UnsubAck(p) => self.encode_unsuback(p, buf),
            Packet::PingReq => {
                buf.put_u8(0xC0); // PINGREQ type + flags
                buf.put_u8(0x00); // Remaining length
                Ok(())
            }
            Packet::PingResp => {
                buf.put_u8(0xD0); // PINGRESP type + flags
                buf.put_u8(0x00); // Remaining length
                Ok(())
            }
            Packet::Disconnect => {
                buf.put_u8(0xE0); // DISCONNECT type + flags
                buf.put_u8(0x00); // Remaining length
                Ok(())
            }
        }
    }

    fn encode_connect(&self, packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
        // Protocol name (6) + level (1) + flags (1) + keep alive (2) + client id
        let remaining_length = PROTOCOL_NAME.len() + 4 + 2 + packet.client_id.len();

        buf.put_u8(0x10); // CONNECT type + flags (0001 0000)
        write_variable_int(buf, remaining_length as u32)?;
        buf.put_slice(&PROTOCOL_NAME);
        buf.put_u8(packet.protocol_level);
        buf.put_u8(packet.flags);
        buf.put_u16(packet.keep_alive);
        write_string(buf, &packet.client_id)?;
        Ok(())
    }

    fn encode_connack(&self, packet: &ConnAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(0x20); // CONNACK type + flags (0010 0000)
        buf.put_u8(0x02); // Remaining length
        buf.put_u8(if packet.session_present { 0x01 } else { 0x00 });
        buf.put_u8(packet.return_code as u8);
        Ok(())
    }

    fn encode_publish(&self, packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let remaining_length = 2 + packet.topic.len() + packet.payload.len();

        buf.put_u8(0x30); // PUBLISH, QoS 0, no DUP, no RETAIN
        write_variable_int(buf, remaining_length as u32)?;
        write_string(buf, &packet.topic)?;
        buf.put_slice(&packet.payload);
        Ok(())
    }

    fn encode_topic_requests(
        &self,
        first_byte: u8,
        packet_id: u16,
        topics: &[TopicRequest],
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        let remaining_length: usize =
            2 + topics.iter().map(|t| 2 + t.filter.len() + 1).sum::<usize>();

        buf.put_u8(first_byte);
        write_variable_int(buf, remaining_length as u32)?;
        buf.put_u16(packet_id);
        for topic in topics {
            write_string(buf, &topic.filter)?;
            buf.put_u8(topic.requested_qos);
        }
        Ok(())
    }

    fn encode_subscribe(&self, packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
        self.encode_topic_requests(0x80 | SUBSCRIBE_FLAGS, packet.packet_id, &packet.topics, buf)
    }

    fn encode_unsubscribe(
        &self,
        packet: &Unsubscribe,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        self.encode_topic_requests(0xA0 | SUBSCRIBE_FLAGS, packet.packet_id, &packet.topics, buf)
    }

    fn encode_suback(&self, packet: &SubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let remaining_length = 2 + packet.granted.len();

        buf.put_u8(0x90); // SUBACK type + flags (1001 0000)
        write_variable_int(buf, remaining_length as u32)?;
        buf.put_u16(packet.packet_id);
        for qos in &packet.granted {
            buf.put_u8(*qos as u8);
        }
        Ok(())
    }

    fn encode_unsuback(&self, packet: &UnsubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(0xB0); // UNSUBACK type + flags (1011 0000)
        buf.put_u8(0x02); // Remaining length
        buf.put_u16(packet.packet_id);
        Ok(())
    }
}
