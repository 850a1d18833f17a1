//! Connection registry
//!
//! Connections live in a [`Slab`]; callers hold [`ConnectionId`] handles.
//! A separate order list keeps registration order so that iteration, and
//! therefore publish delivery, goes oldest connection first. Removal only
//! happens in [`Registry::sweep`], between event loop phases.

use slab::Slab;
use tracing::{debug, trace};

use super::connection::Connection;

/// Opaque handle to a live connection
///
/// Handles are only meaningful while the connection is registered; a slot
/// freed by a sweep may be handed out again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(usize);

impl ConnectionId {
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which closing connections a sweep reclaims
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sweep {
    /// Keep closing connections that still have frames to write
    KeepLingering,
    /// Reclaim every closing connection
    All,
}

/// Owner of every live connection
pub struct Registry<S> {
    slots: Slab<Connection<S>>,
    /// Slot keys in registration order
    order: Vec<usize>,
}

impl<S> Registry<S> {
    pub fn new() -> Self {
        Self {
            slots: Slab::new(),
            order: Vec::new(),
        }
    }

    pub fn insert(&mut self, connection: Connection<S>) -> ConnectionId {
        let key = self.slots.insert(connection);
        self.order.push(key);
        ConnectionId(key)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection<S>> {
        self.slots.get(id.0)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection<S>> {
        self.slots.get_mut(id.0)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Snapshot of the live handles, oldest first
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.order.iter().copied().map(ConnectionId).collect()
    }

    /// Live connections, oldest first
    pub fn iter(&self) -> impl Iterator<Item = (ConnectionId, &Connection<S>)> {
        self.order
            .iter()
            .filter_map(|&key| self.slots.get(key).map(|c| (ConnectionId(key), c)))
    }

    /// Mark a connection for removal by the next sweep
    pub fn mark_closing(&mut self, id: ConnectionId) {
        if let Some(connection) = self.slots.get_mut(id.0) {
            connection.close();
        }
    }

    /// Mark every connection for removal
    pub fn close_all(&mut self) {
        for (_, connection) in self.slots.iter_mut() {
            connection.close();
        }
    }

    /// Whether a live connection other than `except` uses `client_id`
    ///
    /// Connections already marked for closing do not count.
    pub fn identity_in_use(&self, client_id: &str, except: ConnectionId) -> bool {
        self.iter().any(|(id, c)| {
            id != except && !c.is_closing() && c.client_id() == Some(client_id)
        })
    }

    /// Unlink and return closing connections
    ///
    /// Dropping a returned connection closes its stream.
    pub fn sweep(&mut self, mode: Sweep) -> Vec<(ConnectionId, Connection<S>)> {
        let doomed: Vec<usize> = self
            .order
            .iter()
            .copied()
            .filter(|&key| {
                self.slots.get(key).is_some_and(|c| {
                    c.is_closing() && (mode == Sweep::All || !c.is_lingering())
                })
            })
            .collect();

        if doomed.is_empty() {
            return Vec::new();
        }

        let removed: Vec<_> = doomed
            .into_iter()
            .map(|key| {
                let connection = self.slots.remove(key);
                debug!(
                    "Removing connection {} ({}, {})",
                    ConnectionId(key),
                    connection.name(),
                    connection.peer()
                );
                (ConnectionId(key), connection)
            })
            .collect();

        let slots = &self.slots;
        self.order.retain(|&key| slots.contains(key));
        removed
    }

    /// Log every connection and its subscriptions
    pub fn dump(&self) {
        trace!("{} connection(s) registered", self.len());
        for (id, c) in self.iter() {
            let filters: Vec<&str> = c.topics().iter().map(|f| f.filter()).collect();
            trace!(
                "  {} {} {} {:?} subscriptions={:?}",
                id,
                c.name(),
                c.peer(),
                c.state(),
                filters
            );
        }
    }
}

impl<S> Default for Registry<S> {
    fn default() -> Self {
        Self::new()
    }
}
