//! Command validation for the server lockstep loop.
//!
//! Rules, in order:
//! - Unknown connection: DROP
//! - Connection not ready (no `PlayerReady` yet): DROP
//! - Payload larger than the configured limit: DROP + LOG
//! - Sequence not greater than the last accepted one (duplicate or replayed
//!   delivery): DROP
//! - Per-turn rate limit exceeded: DROP
//!
//! The command's `client_id` on the wire is never trusted; it is bound from
//! the session.

use tracing::warn;
use turnsync_lockstep::{Command, CommandSeq};
use turnsync_wire::CommandProto;

use crate::command_buffer::CommandBuffer;
use crate::session::{Player, Session};

/// Validation configuration.
#[derive(Debug, Clone, Copy)]
pub struct ValidationConfig {
    pub max_payload_bytes: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: crate::MAX_COMMAND_PAYLOAD_BYTES,
        }
    }
}

/// Result of command validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    /// Command accepted and buffered for the next turn.
    Accepted,
    /// Dropped: connection is not known.
    DroppedUnknownSession,
    /// Dropped: received before `PlayerReady`.
    DroppedNotReady,
    /// Dropped: payload exceeds the limit.
    DroppedPayloadTooLarge { len: usize, max: usize },
    /// Dropped: sequence already seen.
    DroppedStaleSeq { seq: CommandSeq, last: CommandSeq },
    /// Dropped: rate limit exceeded for this turn.
    DroppedRateLimit,
}

impl ValidationResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Result of attempting to buffer a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferResult {
    Accepted,
    RateLimited,
}

/// Validate a command received from `session` and buffer it on success.
///
/// # Arguments
/// * `command` - The command as received
/// * `session` - Session the command arrived on
/// * `player` - Player bound to the session, if any
/// * `buffer` - Command buffer for the turn being collected
/// * `config` - Validation limits
pub fn validate_command(
    command: CommandProto,
    session: Option<&Session>,
    player: Option<&mut Player>,
    buffer: &mut CommandBuffer,
    config: &ValidationConfig,
) -> ValidationResult {
    let Some(session) = session else {
        return ValidationResult::DroppedUnknownSession;
    };
    let (Some(client_id), Some(player)) = (session.client_id, player) else {
        return ValidationResult::DroppedNotReady;
    };

    if command.payload.len() > config.max_payload_bytes {
        warn!(
            client_id,
            len = command.payload.len(),
            max = config.max_payload_bytes,
            "dropping oversized command"
        );
        return ValidationResult::DroppedPayloadTooLarge {
            len: command.payload.len(),
            max: config.max_payload_bytes,
        };
    }

    if command.seq <= player.last_seq {
        return ValidationResult::DroppedStaleSeq {
            seq: command.seq,
            last: player.last_seq,
        };
    }

    let seq = command.seq;
    match buffer.try_buffer(Command::new(client_id, seq, command.payload)) {
        BufferResult::Accepted => {
            player.last_seq = seq;
            ValidationResult::Accepted
        }
        BufferResult::RateLimited => ValidationResult::DroppedRateLimit,
    }
}
