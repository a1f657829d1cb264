//! Commands and sealed turns.

use crate::digest::StateHasher;
use crate::{ClientId, CommandSeq, TurnNumber};

/// Simulation command: an opaque payload tagged with its origin.
///
/// `client_id` is bound by the server from the session, never trusted from
/// the client. `seq` is the client's local sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Command {
    pub client_id: ClientId,
    pub seq: CommandSeq,
    pub payload: Vec<u8>,
}

impl Command {
    pub fn new(client_id: ClientId, seq: CommandSeq, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            client_id,
            seq,
            payload: payload.into(),
        }
    }
}

/// A sealed, numbered batch of commands.
///
/// Turns are immutable once sealed: the only constructor is [`Turn::seal`]
/// and the fields are read through accessors. `delta` carries the state
/// delta the server appended for this turn (empty when there is none).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    number: TurnNumber,
    commands: Vec<Command>,
    delta: Vec<u8>,
}

impl Turn {
    /// Seal a turn. `commands` must already be in their deterministic order.
    pub fn seal(number: TurnNumber, commands: Vec<Command>, delta: Vec<u8>) -> Self {
        Self {
            number,
            commands,
            delta,
        }
    }

    /// A turn with no commands and no delta.
    pub fn empty(number: TurnNumber) -> Self {
        Self::seal(number, Vec::new(), Vec::new())
    }

    pub fn number(&self) -> TurnNumber {
        self.number
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn delta(&self) -> &[u8] {
        &self.delta
    }

    /// True if the turn carries neither commands nor a delta.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.delta.is_empty()
    }

    pub fn into_parts(self) -> (TurnNumber, Vec<Command>, Vec<u8>) {
        (self.number, self.commands, self.delta)
    }

    /// Deterministic digest over the turn number, the ordered commands and
    /// the delta. Two peers holding the same turn always agree on it.
    pub fn digest(&self) -> u64 {
        let mut hasher = StateHasher::new();
        hasher.update_u64(self.number);
        hasher.update_u64(self.commands.len() as u64);
        for command in &self.commands {
            hasher.update(&[command.client_id]);
            hasher.update_u64(command.seq);
            hasher.update_bytes(&command.payload);
        }
        hasher.update_bytes(&self.delta);
        hasher.finish()
    }
}
