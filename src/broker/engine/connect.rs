//! CONNECT handling

use tracing::{debug, info};

use super::Engine;
use crate::broker::connection::Connection;
use crate::broker::registry::{ConnectionId, Registry};
use crate::protocol::{ConnAck, Connect, ConnectReturnCode, Packet, ProtocolError};

impl Engine {
    /// Accept or refuse the first frame of a connection
    pub(super) fn handle_connect<S>(
        &self,
        registry: &mut Registry<S>,
        id: ConnectionId,
        connect: Connect,
    ) -> Result<(), ProtocolError> {
        let duplicate = registry.identity_in_use(&connect.client_id, id);
        let Some(conn) = registry.get_mut(id) else {
            return Ok(());
        };

        debug!(
            "CONNECT from {}: client_id={:?} keep_alive={}",
            conn.peer(),
            connect.client_id,
            connect.keep_alive
        );

        if connect.client_id.is_empty() {
            info!(
                "Refusing CONNECT from {}: {} (empty client identifier)",
                conn.peer(),
                ProtocolError::IdentifierRejected
            );
            return self.refuse(conn, ConnectReturnCode::IdentifierRejected);
        }
        if duplicate {
            info!(
                "Refusing CONNECT from {}: {} ({} already connected)",
                conn.peer(),
                ProtocolError::IdentifierRejected,
                connect.client_id
            );
            return self.refuse(conn, ConnectReturnCode::IdentifierRejected);
        }

        let connack = self.frame(&Packet::ConnAck(ConnAck::new(ConnectReturnCode::Accepted)))?;
        conn.identify(connect.client_id.into(), connect.keep_alive);
        conn.queue(connack);

        info!(
            "Client {} connected from {} (keep alive {}s)",
            conn.name(),
            conn.peer(),
            conn.keep_alive()
        );
        Ok(())
    }

    /// Queue a negative CONNACK and close once it is written
    pub(super) fn refuse<S>(
        &self,
        conn: &mut Connection<S>,
        code: ConnectReturnCode,
    ) -> Result<(), ProtocolError> {
        debug_assert!(!code.is_accepted());
        let connack = self.frame(&Packet::ConnAck(ConnAck::new(code)))?;
        conn.queue(connack);
        conn.close_after_flush();
        Ok(())
    }
}
