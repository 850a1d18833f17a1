//! Per-connection state
//!
//! A [`Connection`] owns its stream, the bytes of the frame currently being
//! assembled, the FIFO of encoded frames waiting to be written and the
//! connection's subscriptions. It is generic over the stream so the
//! protocol engine can be driven by an in-memory stream in tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use crate::codec::Decoder;
use crate::protocol::{DecodeError, FixedHeader, Packet, ProtocolError};
use crate::topic::TopicStore;

/// Size of a single read from the socket
const READ_CHUNK: usize = 4096;

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(io::Error),
    Protocol(ProtocolError),
    /// Peer closed the stream between frames
    PeerClosed,
    /// Peer closed the stream in the middle of a frame
    ShortRead,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ConnectionError::PeerClosed => write!(f, "Connection closed by peer"),
            ConnectionError::ShortRead => write!(f, "Connection closed mid-frame"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Io(e) => Some(e),
            ConnectionError::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Protocol(ProtocolError::Decode(e))
    }
}

/// Protocol state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Waiting for CONNECT
    AwaitingIdentity,
    /// CONNECT accepted
    Ready,
    /// Marked for removal by the next sweep
    Closing,
}

/// A client connection
pub struct Connection<S> {
    stream: S,
    peer: SocketAddr,
    state: State,
    /// Client identifier, set once by an accepted CONNECT
    client_id: Option<Arc<str>>,
    /// Keep the connection until queued frames are written
    linger: bool,
    /// Set when the peer went away during a read; the frame buffer is gone
    skip: bool,

    // Sticky readiness, cleared when the stream reports WouldBlock
    readable: bool,
    writable: bool,
    hangup: bool,

    /// Keep alive in seconds, 0 disables eviction
    keep_alive: u16,
    last_activity: Instant,

    inbound: BytesMut,
    /// Header of the frame being assembled in `inbound`
    header: Option<FixedHeader>,

    outbound: VecDeque<Bytes>,
    /// Bytes of the front frame already written
    written: usize,

    topics: TopicStore,
    /// Packet identifier of the last SUBSCRIBE/UNSUBSCRIBE
    packet_id: u16,
}

impl<S> Connection<S> {
    pub fn new(stream: S, peer: SocketAddr, now: Instant) -> Self {
        Self {
            stream,
            peer,
            state: State::AwaitingIdentity,
            client_id: None,
            linger: false,
            skip: false,
            readable: false,
            writable: false,
            hangup: false,
            keep_alive: 0,
            last_activity: now,
            inbound: BytesMut::with_capacity(READ_CHUNK),
            header: None,
            outbound: VecDeque::new(),
            written: 0,
            topics: TopicStore::new(),
            packet_id: 0,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Client identifier for log lines
    pub fn name(&self) -> &str {
        self.client_id.as_deref().unwrap_or("<unidentified>")
    }

    pub fn is_closing(&self) -> bool {
        self.state == State::Closing
    }

    /// Closing but still holding frames that must be written first
    pub fn is_lingering(&self) -> bool {
        self.is_closing() && self.linger && self.has_output()
    }

    pub fn is_skipped(&self) -> bool {
        self.skip
    }

    /// Mark for removal, dropping anything queued
    pub fn close(&mut self) {
        self.state = State::Closing;
        self.linger = false;
    }

    /// Mark for removal once queued frames have been written
    pub fn close_after_flush(&mut self) {
        if self.state != State::Closing {
            self.state = State::Closing;
            self.linger = true;
        }
    }

    /// Accept the CONNECT: the identifier never changes afterwards
    pub(crate) fn identify(&mut self, client_id: Arc<str>, keep_alive: u16) {
        debug_assert!(self.client_id.is_none());
        self.client_id = Some(client_id);
        self.keep_alive = keep_alive;
        self.state = State::Ready;
    }

    pub fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Silent for longer than 1.5 times the keep alive
    pub fn is_idle(&self, now: Instant) -> bool {
        if self.keep_alive == 0 {
            return false;
        }
        let timeout = Duration::from_millis(self.keep_alive as u64 * 1500);
        now.saturating_duration_since(self.last_activity) > timeout
    }

    pub fn topics(&self) -> &TopicStore {
        &self.topics
    }

    pub fn topics_mut(&mut self) -> &mut TopicStore {
        &mut self.topics
    }

    pub fn packet_id(&self) -> u16 {
        self.packet_id
    }

    pub(crate) fn set_packet_id(&mut self, packet_id: u16) {
        self.packet_id = packet_id;
    }

    pub fn set_readable(&mut self) {
        self.readable = true;
    }

    pub fn set_writable(&mut self) {
        self.writable = true;
    }

    pub fn set_hangup(&mut self) {
        self.hangup = true;
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_hung_up(&self) -> bool {
        self.hangup
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// A whole frame is buffered and waiting for the engine
    pub fn has_frame(&self) -> bool {
        matches!(self.header, Some(h) if self.inbound.len() >= h.frame_len())
    }

    pub fn has_output(&self) -> bool {
        !self.outbound.is_empty()
    }

    pub fn queued(&self) -> usize {
        self.outbound.len()
    }

    /// Append an encoded frame to the outbound queue
    pub fn queue(&mut self, frame: Bytes) {
        self.outbound.push_back(frame);
    }

    /// Replace every queued frame that has not started going out
    pub fn replace_queued(&mut self, frame: Bytes) {
        if self.written > 0 {
            self.outbound.truncate(1);
        } else {
            self.outbound.clear();
        }
        self.outbound.push_back(frame);
    }

    /// Parse the fixed header if enough bytes are buffered
    fn parse_header(&mut self, decoder: &Decoder) -> Result<(), DecodeError> {
        if self.header.is_none() {
            self.header = decoder.decode_header(&self.inbound)?;
        }
        Ok(())
    }

    /// Remove the buffered frame and decode its body
    ///
    /// Returns `None` until a whole frame has arrived.
    pub fn take_frame(&mut self, decoder: &Decoder) -> Option<Result<Packet, DecodeError>> {
        let header = self.header?;
        if self.inbound.len() < header.frame_len() {
            return None;
        }
        let frame = self.inbound.split_to(header.frame_len());
        // A bad header behind this frame is reported by the next fill_inbound
        self.header = decoder.decode_header(&self.inbound).ok().flatten();
        Some(decoder.decode_body(&header, &frame[header.header_len..]))
    }

    /// Record inbound traffic for keep alive purposes
    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }
}

impl<S: Read> Connection<S> {
    /// Read until one whole frame is buffered or the stream would block
    ///
    /// Bytes already in the buffer are parsed first, so a frame that arrived
    /// together with the previous one is picked up without a read.
    pub fn fill_inbound(&mut self, decoder: &Decoder) -> Result<(), ConnectionError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            self.parse_header(decoder)?;
            if self.has_frame() || !self.readable {
                return Ok(());
            }

            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.skip = true;
                    self.readable = false;
                    let partial = !self.inbound.is_empty();
                    self.inbound.clear();
                    self.header = None;
                    return Err(if partial {
                        ConnectionError::ShortRead
                    } else {
                        ConnectionError::PeerClosed
                    });
                }
                Ok(n) => self.inbound.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.readable = false;
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl<S: Write> Connection<S> {
    /// Write the front frame of the outbound queue
    ///
    /// Returns `true` once the frame is completely written. A partial write
    /// leaves the remainder for the next call.
    pub fn flush_one(&mut self) -> Result<bool, ConnectionError> {
        let Some(frame) = self.outbound.front() else {
            return Ok(false);
        };

        while self.written < frame.len() {
            match self.stream.write(&frame[self.written..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => self.written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.writable = false;
                    return Ok(false);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        self.outbound.pop_front();
        self.written = 0;
        Ok(true)
    }
}

impl<S> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("client_id", &self.client_id)
            .field("state", &self.state)
            .field("keep_alive", &self.keep_alive)
            .field("topics", &self.topics.len())
            .field("queued", &self.outbound.len())
            .finish()
    }
}
