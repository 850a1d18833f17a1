//! PUBLISH fan-out

use tracing::{debug, trace};

use super::{Engine, FanoutMode};
use crate::broker::registry::{ConnectionId, Registry};
use crate::protocol::{Packet, ProtocolError, Publish};
use crate::topic::tokenize;

impl Engine {
    /// Queue the message on every connection with a matching subscription
    ///
    /// The sender is included. Copies that would grow a queue past
    /// `max_queued` are dropped. Returns the number of frames queued.
    pub(super) fn handle_publish<S>(
        &self,
        registry: &mut Registry<S>,
        from: ConnectionId,
        publish: Publish,
    ) -> Result<usize, ProtocolError> {
        if let Some(sender) = registry.get(from) {
            trace!(
                "PUBLISH from {} to {} ({} bytes)",
                sender.name(),
                publish.topic,
                publish.payload.len()
            );
        }

        let levels = tokenize(&publish.topic);
        let frame = self.frame(&Packet::Publish(publish.clone()))?;
        let mut delivered = 0;

        for id in registry.ids() {
            let Some(conn) = registry.get_mut(id) else {
                continue;
            };
            if conn.is_closing() {
                continue;
            }

            let copies = match self.fanout {
                FanoutMode::PerFilter => conn.topics().matching(&levels).count(),
                FanoutMode::PerConnection | FanoutMode::LastMatch => {
                    usize::from(conn.topics().matches(&levels))
                }
            };
            if copies == 0 {
                continue;
            }

            let queued = match self.fanout {
                FanoutMode::LastMatch => {
                    conn.replace_queued(frame.clone());
                    1
                }
                FanoutMode::PerConnection | FanoutMode::PerFilter => {
                    let room = match self.max_queued {
                        0 => copies,
                        max => max.saturating_sub(conn.queued()).min(copies),
                    };
                    for _ in 0..room {
                        conn.queue(frame.clone());
                    }
                    room
                }
            };
            if queued < copies {
                debug!(
                    "Outbound queue of {} full ({} frames), dropped {} PUBLISH frame(s)",
                    conn.name(),
                    conn.queued(),
                    copies - queued
                );
            }
            trace!("  -> {} x{}", conn.name(), queued);
            delivered += queued;
        }

        debug!("PUBLISH {} delivered {} time(s)", publish.topic, delivered);
        Ok(delivered)
    }
}
