//! Client transport boundary.
//!
//! The concrete transport is owned by the application. It reports back
//! through the controller's `on_connected`, `on_disconnected`, `on_error` and
//! `on_message_received` entry points.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("transport failure: {0}")]
    Failed(String),
}

pub trait ClientTransport {
    /// Begin connecting. Completion is reported through `on_connected` or
    /// `on_error`.
    fn connect(&mut self);

    fn disconnect(&mut self);

    fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError>;
}
