//! SUBSCRIBE and UNSUBSCRIBE handling

use tracing::debug;

use super::Engine;
use crate::broker::connection::Connection;
use crate::protocol::{Packet, ProtocolError, QoS, SubAck, Subscribe, UnsubAck, Unsubscribe};

impl Engine {
    /// Store every requested filter and acknowledge them in request order
    ///
    /// Returns the number of filters processed.
    pub(super) fn handle_subscribe<S>(
        &self,
        conn: &mut Connection<S>,
        subscribe: Subscribe,
    ) -> Result<usize, ProtocolError> {
        debug!(
            "SUBSCRIBE from {} (packet id {}): {:?}",
            conn.name(),
            subscribe.packet_id,
            subscribe.topics.iter().map(|t| &t.filter).collect::<Vec<_>>()
        );

        let topics = conn.topics_mut();
        topics.begin_batch();
        for request in &subscribe.topics {
            // Only QoS 0 is served, whatever was requested
            topics.insert(&request.filter, QoS::AtMostOnce);
        }
        let granted: Vec<QoS> = topics.last_batch().iter().map(|f| f.qos()).collect();
        let count = granted.len();

        conn.set_packet_id(subscribe.packet_id);
        let suback = self.frame(&Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            granted,
        }))?;
        conn.queue(suback);
        Ok(count)
    }

    /// Drop the listed filters; unknown filters are ignored
    ///
    /// Returns the number of filters processed.
    pub(super) fn handle_unsubscribe<S>(
        &self,
        conn: &mut Connection<S>,
        unsubscribe: Unsubscribe,
    ) -> Result<usize, ProtocolError> {
        let mut removed = 0;
        for request in &unsubscribe.topics {
            if conn.topics_mut().remove(&request.filter) {
                removed += 1;
            } else {
                debug!("{} was not subscribed to {}", conn.name(), request.filter);
            }
        }
        debug!(
            "UNSUBSCRIBE from {} (packet id {}): {} of {} filter(s) removed",
            conn.name(),
            unsubscribe.packet_id,
            removed,
            unsubscribe.topics.len()
        );

        conn.set_packet_id(unsubscribe.packet_id);
        let unsuback = self.frame(&Packet::UnsubAck(UnsubAck {
            packet_id: unsubscribe.packet_id,
        }))?;
        conn.queue(unsuback);
        Ok(unsubscribe.topics.len())
    }
}
