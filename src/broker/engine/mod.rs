//! Protocol state machine
//!
//! The [`Engine`] takes at most one buffered frame from each connection
//! per cycle and applies it: CONNECT ordering, subscriptions, publish
//! fan-out, ping and disconnect. It never removes connections; anything
//! that must go is marked closing and left for the registry sweep.

mod connect;
mod publish;
mod subscribe;

#[cfg(test)]
mod tests;

use std::time::Instant;

use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use tracing::{debug, info, trace, warn};

use super::connection::{Connection, State};
use super::registry::{ConnectionId, Registry};
use crate::codec::{Decoder, Encoder};
use crate::protocol::{ConnectReturnCode, DecodeError, Packet, ProtocolError};

/// How a PUBLISH is copied to a connection with matching subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanoutMode {
    /// One copy per connection, replacing frames not yet written
    LastMatch,
    /// One copy per connection, appended to the queue
    #[default]
    PerConnection,
    /// One copy per matching subscription
    PerFilter,
}

/// Default cap on PUBLISH frames waiting in one connection's outbound queue
pub const DEFAULT_MAX_QUEUED_MESSAGES: usize = 1000;

/// Protocol engine
#[derive(Debug, Clone)]
pub struct Engine {
    decoder: Decoder,
    encoder: Encoder,
    fanout: FanoutMode,
    max_queued: usize,
}

impl Engine {
    pub fn new(decoder: Decoder, fanout: FanoutMode) -> Self {
        Self {
            decoder,
            encoder: Encoder::new(),
            fanout,
            max_queued: DEFAULT_MAX_QUEUED_MESSAGES,
        }
    }

    /// Limit the outbound queue length a PUBLISH copy may join (0 = unbounded)
    pub fn with_max_queued(mut self, max: usize) -> Self {
        self.max_queued = max;
        self
    }

    pub fn max_queued(&self) -> usize {
        self.max_queued
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    pub fn fanout(&self) -> FanoutMode {
        self.fanout
    }

    /// Apply one buffered frame from every connection that has one
    ///
    /// Returns the number of frames processed.
    pub fn process<S>(&self, registry: &mut Registry<S>, now: Instant) -> usize {
        let mut processed = 0;

        for id in registry.ids() {
            let Some(conn) = registry.get_mut(id) else {
                continue;
            };
            if conn.is_closing() || conn.is_skipped() {
                continue;
            }
            let Some(frame) = conn.take_frame(&self.decoder) else {
                continue;
            };
            conn.touch(now);
            processed += 1;

            let result = match frame {
                Ok(packet) => self.dispatch(registry, id, packet),
                Err(e) => self.reject_frame(registry, id, e),
            };

            if let Err(e) = result {
                if let Some(conn) = registry.get_mut(id) {
                    debug!("Closing {} ({}): {}", conn.name(), conn.peer(), e);
                    conn.close();
                }
            }
        }

        processed
    }

    fn dispatch<S>(
        &self,
        registry: &mut Registry<S>,
        id: ConnectionId,
        packet: Packet,
    ) -> Result<(), ProtocolError> {
        let Some(state) = registry.get(id).map(Connection::state) else {
            return Ok(());
        };

        match (state, packet) {
            (State::AwaitingIdentity, Packet::Connect(connect)) => {
                self.handle_connect(registry, id, connect)
            }
            (State::AwaitingIdentity, _) => Err(ProtocolError::ProtocolViolation(
                "first packet must be CONNECT",
            )),
            (_, Packet::Connect(_)) => Err(ProtocolError::ProtocolViolation(
                "CONNECT received twice",
            )),
            (_, Packet::Publish(publish)) => {
                self.handle_publish(registry, id, publish)?;
                Ok(())
            }
            (_, Packet::Subscribe(subscribe)) => {
                if let Some(conn) = registry.get_mut(id) {
                    self.handle_subscribe(conn, subscribe)?;
                }
                if tracing::enabled!(tracing::Level::TRACE) {
                    registry.dump();
                }
                Ok(())
            }
            (_, Packet::Unsubscribe(unsubscribe)) => {
                if let Some(conn) = registry.get_mut(id) {
                    self.handle_unsubscribe(conn, unsubscribe)?;
                }
                if tracing::enabled!(tracing::Level::TRACE) {
                    registry.dump();
                }
                Ok(())
            }
            (_, Packet::PingReq) => {
                let pingresp = self.frame(&Packet::PingResp)?;
                if let Some(conn) = registry.get_mut(id) {
                    trace!("PINGREQ from {}", conn.name());
                    conn.queue(pingresp);
                }
                Ok(())
            }
            (_, Packet::Disconnect) => {
                if let Some(conn) = registry.get_mut(id) {
                    info!("Client {} disconnected", conn.name());
                    conn.close();
                }
                Ok(())
            }
            (_, other) => Err(ProtocolError::UnsupportedFrameType(
                other.packet_type() as u8,
            )),
        }
    }

    /// Handle a frame whose body failed to decode
    ///
    /// A CONNECT with the wrong protocol level is refused with a CONNACK;
    /// every other failure closes the connection without a reply.
    fn reject_frame<S>(
        &self,
        registry: &mut Registry<S>,
        id: ConnectionId,
        error: DecodeError,
    ) -> Result<(), ProtocolError> {
        let Some(conn) = registry.get_mut(id) else {
            return Ok(());
        };

        match error {
            DecodeError::InvalidProtocolLevel(level) if conn.state() == State::AwaitingIdentity => {
                info!(
                    "Refusing CONNECT from {}: unsupported protocol level {}",
                    conn.peer(),
                    level
                );
                self.refuse(conn, ConnectReturnCode::UnacceptableProtocolLevel)
            }
            DecodeError::InvalidProtocolName => {
                warn!("Invalid protocol name from {}", conn.peer());
                Err(error.into())
            }
            other => Err(other.into()),
        }
    }

    /// Mark connections silent for longer than 1.5 times their keep alive
    pub fn sweep_keep_alive<S>(&self, registry: &mut Registry<S>, now: Instant) -> usize {
        let mut evicted = 0;
        for id in registry.ids() {
            let Some(conn) = registry.get_mut(id) else {
                continue;
            };
            if !conn.is_closing() && conn.is_idle(now) {
                info!(
                    "Closing {}: {} ({}s, last seen {:?} ago)",
                    conn.name(),
                    ProtocolError::KeepAliveTimeout,
                    conn.keep_alive(),
                    now.saturating_duration_since(conn.last_activity())
                );
                conn.close();
                evicted += 1;
            }
        }
        evicted
    }

    /// Encode an outbound frame
    fn frame(&self, packet: &Packet) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        self.encoder.encode(packet, &mut buf)?;
        Ok(buf.freeze())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(Decoder::new(), FanoutMode::default())
    }
}
