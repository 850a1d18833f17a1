//! MQTT Broker Core
//!
//! A single thread owns the listener, every connection and all buffers.
//! Each cycle of [`Broker::run`] goes through the same phases:
//!
//! 1. wait for readiness (bounded by `poll_interval`) and accept at most one
//!    connection
//! 2. mark hung up connections for closing
//! 3. sweep closed connections, keeping those still flushing a reply
//! 4. read into every readable connection until it holds a whole frame
//! 5. run the protocol engine over connections holding a frame
//! 6. write at most one queued frame per writable connection
//! 7. mark connections whose keep alive expired
//! 8. sweep every closed connection
//!
//! The shutdown flag is checked between phases.

mod connection;
mod engine;
mod registry;

pub use connection::{Connection, ConnectionError, State};
pub use engine::{Engine, FanoutMode, DEFAULT_MAX_QUEUED_MESSAGES};
pub use registry::{ConnectionId, Registry, Sweep};

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, trace, warn};

use crate::codec::Decoder;
use crate::protocol::{DecodeError, ProtocolError};

/// Token of the listening socket; connections use their slot index
const LISTENER: Token = Token(usize::MAX);

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// Longest wait for readiness per cycle
    pub poll_interval: Duration,
    /// Listen backlog
    pub backlog: u32,
    /// Maximum connections (0 = unbounded)
    pub max_connections: usize,
    /// Maximum remaining length of an inbound frame
    pub max_packet_size: usize,
    /// Maximum PUBLISH frames waiting per connection (0 = unbounded)
    pub max_queued_messages: usize,
    /// PUBLISH fan-out policy
    pub fanout: FanoutMode,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 1883)),
            poll_interval: Duration::from_millis(20),
            backlog: 256,
            max_connections: 10_000,
            max_packet_size: 1024 * 1024, // 1 MB
            max_queued_messages: DEFAULT_MAX_QUEUED_MESSAGES,
            fanout: FanoutMode::default(),
        }
    }
}

/// The MQTT Broker
pub struct Broker {
    config: BrokerConfig,
    poll: Poll,
    listener: TcpListener,
    /// Listener reported readable and has not returned WouldBlock since
    listener_ready: bool,
    /// No accept is attempted before this after an accept error
    accept_retry_at: Option<Instant>,
    registry: Registry<TcpStream>,
    engine: Engine,
}

impl Broker {
    /// Bind the listening socket and set up polling
    pub fn bind(config: BrokerConfig) -> io::Result<Self> {
        let mut listener = listen(config.bind_addr, config.backlog)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        let decoder = Decoder::new().with_max_packet_size(config.max_packet_size);
        let engine =
            Engine::new(decoder, config.fanout).with_max_queued(config.max_queued_messages);

        Ok(Self {
            config,
            poll,
            listener,
            listener_ready: false,
            accept_retry_at: None,
            registry: Registry::new(),
            engine,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Run until `shutdown` is set
    ///
    /// Per-connection failures only close that connection; an error is
    /// returned only if polling itself fails.
    pub fn run(&mut self, shutdown: &AtomicBool) -> io::Result<()> {
        info!("MQTT/TCP listening on {}", self.local_addr()?);
        debug!(
            "poll_interval={:?} max_connections={} max_packet_size={} max_queued_messages={} fanout={:?}",
            self.config.poll_interval,
            self.config.max_connections,
            self.config.max_packet_size,
            self.config.max_queued_messages,
            self.config.fanout
        );

        let mut events = Events::with_capacity(1024);
        let result = loop {
            match self.cycle(&mut events, shutdown) {
                Ok(true) => {}
                Ok(false) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        warn!(
            "Broker shutting down, closing {} connection(s)",
            self.registry.len()
        );
        self.registry.close_all();
        self.reclaim(Sweep::All);
        info!("Broker stopped");
        result
    }

    /// One pass through every phase; `false` once shutdown was requested
    fn cycle(&mut self, events: &mut Events, shutdown: &AtomicBool) -> io::Result<bool> {
        self.poll_readiness(events)?;
        self.accept_one(Instant::now());
        if shutdown.load(Ordering::Acquire) {
            return Ok(false);
        }

        close_hung_up(&mut self.registry);
        if shutdown.load(Ordering::Acquire) {
            return Ok(false);
        }

        self.reclaim(Sweep::KeepLingering);
        if shutdown.load(Ordering::Acquire) {
            return Ok(false);
        }

        read_inbound(&mut self.registry, self.engine.decoder());
        if shutdown.load(Ordering::Acquire) {
            return Ok(false);
        }

        self.engine.process(&mut self.registry, Instant::now());
        if shutdown.load(Ordering::Acquire) {
            return Ok(false);
        }

        write_outbound(&mut self.registry);
        if shutdown.load(Ordering::Acquire) {
            return Ok(false);
        }

        self.engine
            .sweep_keep_alive(&mut self.registry, Instant::now());
        if shutdown.load(Ordering::Acquire) {
            return Ok(false);
        }

        self.reclaim(Sweep::All);
        Ok(!shutdown.load(Ordering::Acquire))
    }

    /// Wait for readiness and record it on the listener and connections
    fn poll_readiness(&mut self, events: &mut Events) -> io::Result<()> {
        let timeout = if self.has_pending_work(Instant::now()) {
            Duration::ZERO
        } else {
            self.config.poll_interval
        };

        match self.poll.poll(events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        for event in events.iter() {
            if event.token() == LISTENER {
                self.listener_ready = true;
                continue;
            }
            let Some(conn) = self
                .registry
                .get_mut(ConnectionId::from_index(event.token().0))
            else {
                continue;
            };
            if event.is_readable() || event.is_read_closed() {
                conn.set_readable();
            }
            if event.is_writable() {
                conn.set_writable();
            }
            if event.is_error() || (event.is_read_closed() && event.is_write_closed()) {
                conn.set_hangup();
            }
        }
        Ok(())
    }

    /// Readiness is edge-triggered: anything left over from the last cycle
    /// must be handled without waiting for a new event
    fn has_pending_work(&self, now: Instant) -> bool {
        self.can_accept(now)
            || self.registry.iter().any(|(_, c)| {
                c.has_frame()
                    || (!c.is_closing() && c.is_readable())
                    || (c.is_writable()
                        && c.has_output()
                        && (!c.is_closing() || c.is_lingering()))
            })
    }

    fn can_accept(&self, now: Instant) -> bool {
        self.listener_ready && self.accept_retry_at.map_or(true, |at| now >= at)
    }

    /// Back off one poll interval, e.g. while out of file descriptors
    fn defer_accept(&mut self, now: Instant) {
        self.accept_retry_at = Some(now + self.config.poll_interval);
    }

    fn accept_one(&mut self, now: Instant) {
        if !self.can_accept(now) {
            return;
        }

        let (stream, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.listener_ready = false;
                return;
            }
            Err(e) => {
                warn!(
                    "Accept failed: {}, retrying in {:?}",
                    e, self.config.poll_interval
                );
                self.defer_accept(now);
                return;
            }
        };
        self.accept_retry_at = None;

        if self.config.max_connections > 0 && self.registry.len() >= self.config.max_connections
        {
            warn!(
                "Connection limit ({}) reached, dropping connection from {}",
                self.config.max_connections, peer
            );
            return;
        }

        if let Err(e) = stream.set_nodelay(true) {
            trace!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let id = self
            .registry
            .insert(Connection::new(stream, peer, Instant::now()));
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        if let Err(e) = self.poll.registry().register(
            conn.stream_mut(),
            Token(id.index()),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            warn!("Failed to register connection from {}: {}", peer, e);
            conn.close();
            return;
        }

        debug!(
            "Accepted connection {} from {} ({} total)",
            id,
            peer,
            self.registry.len()
        );
    }

    /// Sweep the registry and stop polling removed sockets
    fn reclaim(&mut self, mode: Sweep) {
        for (id, mut conn) in self.registry.sweep(mode) {
            if let Err(e) = self.poll.registry().deregister(conn.stream_mut()) {
                trace!("Failed to deregister connection {}: {}", id, e);
            }
        }
    }
}

/// Create the non-blocking listening socket
fn listen(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;
    Ok(TcpListener::from_std(socket.into()))
}

/// Mark connections whose socket reported an error or a full hangup
pub(crate) fn close_hung_up<S>(registry: &mut Registry<S>) {
    for id in registry.ids() {
        if let Some(conn) = registry.get_mut(id) {
            if conn.is_hung_up() && !conn.is_closing() {
                debug!("Connection {} ({}) hung up", conn.name(), conn.peer());
                conn.close();
            }
        }
    }
}

/// Fill inbound buffers; read failures mark the connection for closing
pub(crate) fn read_inbound<S: Read>(registry: &mut Registry<S>, decoder: &Decoder) {
    for id in registry.ids() {
        let Some(conn) = registry.get_mut(id) else {
            continue;
        };
        if conn.is_closing() {
            continue;
        }

        let Err(e) = conn.fill_inbound(decoder) else {
            continue;
        };
        match &e {
            ConnectionError::PeerClosed => {
                debug!("Connection {} ({}) closed by peer", conn.name(), conn.peer())
            }
            ConnectionError::ShortRead => {
                debug!("Short read from {} ({}), frame discarded", conn.name(), conn.peer())
            }
            ConnectionError::Protocol(ProtocolError::Decode(DecodeError::MalformedLength)) => {
                warn!("Malformed remaining length from {}", conn.peer())
            }
            ConnectionError::Protocol(ProtocolError::Decode(DecodeError::InvalidFlags)) => {
                warn!("Invalid fixed header flags from {}", conn.peer())
            }
            _ => debug!("Read from {} ({}) failed: {}", conn.name(), conn.peer(), e),
        }
        conn.close();
    }
}

/// Write at most one queued frame per writable connection
pub(crate) fn write_outbound<S: Write>(registry: &mut Registry<S>) {
    for id in registry.ids() {
        let Some(conn) = registry.get_mut(id) else {
            continue;
        };
        if !conn.is_writable() || !conn.has_output() {
            continue;
        }
        if conn.is_closing() && !conn.is_lingering() {
            continue;
        }

        if let Err(e) = conn.flush_one() {
            debug!("Write to {} ({}) failed: {}", conn.name(), conn.peer(), e);
            conn.close();
        }
    }
}
