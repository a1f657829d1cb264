//! Server-side simulation hook.
//!
//! The lockstep loop calls into a [`ServerSimulation`] once per sealed turn.
//! Whatever bytes it returns are appended to that turn as its state delta,
//! so clients receive the commands and their resulting state in one unit.

use std::time::Duration;

use turnsync_lockstep::{ClientId, Command, TurnNumber};

pub trait ServerSimulation {
    fn on_client_connected(&mut self, _client_id: ClientId) {}

    fn on_client_disconnected(&mut self, _client_id: ClientId) {}

    /// Advance authoritative state by one turn and return its delta (empty
    /// for none). `commands` are in seal order.
    fn step(&mut self, turn: TurnNumber, commands: &[Command], dt: Duration) -> Vec<u8>;
}

/// Relay-only server: turns carry commands and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSimulation;

impl ServerSimulation for NoSimulation {
    fn step(&mut self, _turn: TurnNumber, _commands: &[Command], _dt: Duration) -> Vec<u8> {
        Vec::new()
    }
}
