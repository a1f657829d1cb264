//! Server transport boundary.
//!
//! The concrete transport (WebSocket, TCP, relay, in-process) lives outside
//! this crate. It delivers connection events and messages to the
//! [`LockstepServer`](crate::LockstepServer) entry points and sends bytes on
//! its behalf.

use thiserror::Error;

use crate::session::ConnectionId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection {0} is closed")]
    Closed(ConnectionId),
    #[error("transport failure: {0}")]
    Failed(String),
}

pub trait ServerTransport {
    fn send_to(&mut self, connection: ConnectionId, bytes: &[u8]) -> Result<(), TransportError>;

    /// Close a connection from the server side.
    fn disconnect(&mut self, connection: ConnectionId);
}
