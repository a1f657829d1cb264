//! Connection sessions and lockstep players.
//!
//! A [`Session`] lives as long as one transport connection. A [`Player`]
//! outlives its connections: a client that reconnects with the same player
//! token gets its old [`ClientId`] back.

use turnsync_lockstep::{ClientId, CommandSeq, TurnNumber};

/// Transport-level connection identifier, chosen by the transport.
pub type ConnectionId = u32;

/// Per-connection state.
#[derive(Debug, Clone)]
pub struct Session {
    pub connection: ConnectionId,
    /// Bound once the client sent `PlayerReady`.
    pub client_id: Option<ClientId>,
}

impl Session {
    pub fn new(connection: ConnectionId) -> Self {
        Self {
            connection,
            client_id: None,
        }
    }

    /// Ready sessions receive the turn stream.
    pub fn is_ready(&self) -> bool {
        self.client_id.is_some()
    }
}

/// A lockstep participant.
#[derive(Debug, Clone)]
pub struct Player {
    pub client_id: ClientId,
    pub token: String,
    /// Current connection, `None` while disconnected.
    pub connection: Option<ConnectionId>,
    /// Highest command sequence accepted from this player.
    pub last_seq: CommandSeq,
    /// Turn that was current when the player first became ready.
    pub joined_at: TurnNumber,
    pub reconnects: u32,
}

impl Player {
    pub fn new(
        client_id: ClientId,
        token: String,
        connection: ConnectionId,
        joined_at: TurnNumber,
    ) -> Self {
        Self {
            client_id,
            token,
            connection: Some(connection),
            last_seq: 0,
            joined_at,
            reconnects: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }
}
