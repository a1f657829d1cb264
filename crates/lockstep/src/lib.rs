//! turnsync Lockstep Core
//!
//! Deterministic building blocks shared by the server loop, the client
//! controller and the replay tooling.
//!
//! # Architecture Constraints
//!
//! This crate MUST NOT:
//! - Perform I/O operations (file, network, etc.)
//! - Read wall-clock time
//! - Use ambient randomness (only match-seeded [`RandomRoot`] generators)
//!
//! Time only enters as `Duration` deltas handed to [`LockstepClock`]. Turns
//! are produced by the server, retained in a [`TurnBuffer`] and consumed by a
//! [`TurnHandler`] in strictly increasing turn order.

#![deny(unsafe_code)]

pub mod clock;
pub mod config;
pub mod digest;
pub mod listeners;
pub mod random;
pub mod turn;
pub mod turn_buffer;

use std::time::Duration;

pub use clock::LockstepClock;
pub use config::{ConfigError, LockstepConfig};
pub use digest::StateHasher;
pub use listeners::{ListenerId, Listeners};
pub use random::{LockstepRng, RandomRoot};
pub use turn::{Command, Turn};
pub use turn_buffer::{TurnBuffer, TurnBufferError};

// ============================================================================
// Type Aliases
// ============================================================================

/// Number of a sealed turn. Turn 0 is the first turn of a match.
pub type TurnNumber = u64;

/// Lockstep participant identifier, assigned by the server.
///
/// Used as the cross-client ordering key when a turn is sealed: commands are
/// ordered by ascending `ClientId`, then by arrival.
pub type ClientId = u8;

/// Per-client command sequence number, increasing from 1.
pub type CommandSeq = u64;

// ============================================================================
// Turn Handler
// ============================================================================

/// Error returned by a [`TurnHandler`] that could not apply a turn.
///
/// Any such error is a desync: the consumer cannot continue without a resync.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("turn {turn} could not be applied: {reason}")]
pub struct TurnApplyError {
    pub turn: TurnNumber,
    pub reason: String,
}

impl TurnApplyError {
    pub fn new(turn: TurnNumber, reason: impl Into<String>) -> Self {
        Self {
            turn,
            reason: reason.into(),
        }
    }
}

/// Application side of the lockstep loop.
///
/// `apply_turn` is called once per turn, in turn order, on the boundary of
/// every `command_step`. `simulate` is called once per `simulation_step`,
/// after the turn for that step (if any) has been applied.
pub trait TurnHandler {
    fn apply_turn(&mut self, turn: &Turn) -> Result<(), TurnApplyError>;

    fn simulate(&mut self, _step: Duration) {}
}

/// Handler that accepts every turn and simulates nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl TurnHandler for NoopHandler {
    fn apply_turn(&mut self, _turn: &Turn) -> Result<(), TurnApplyError> {
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    struct Recorder {
        applied: Vec<TurnNumber>,
        simulated: u32,
    }

    impl TurnHandler for Recorder {
        fn apply_turn(&mut self, turn: &Turn) -> Result<(), TurnApplyError> {
            if turn.number() == 3 {
                return Err(TurnApplyError::new(3, "unknown command"));
            }
            self.applied.push(turn.number());
            Ok(())
        }

        fn simulate(&mut self, _step: Duration) {
            self.simulated += 1;
        }
    }

    #[test]
    fn test_handler_error_carries_turn() {
        let mut recorder = Recorder {
            applied: Vec::new(),
            simulated: 0,
        };
        for n in 0..3 {
            recorder.apply_turn(&Turn::empty(n)).unwrap();
            recorder.simulate(Duration::from_millis(100));
        }
        let err = recorder.apply_turn(&Turn::empty(3)).unwrap_err();

        assert_eq!(recorder.applied, vec![0, 1, 2]);
        assert_eq!(recorder.simulated, 3);
        assert_eq!(err.turn, 3);
        assert_eq!(err.to_string(), "turn 3 could not be applied: unknown command");
    }

    #[test]
    fn test_noop_handler_accepts_everything() {
        let mut handler = NoopHandler;
        let turn = Turn::seal(7, vec![Command::new(1, 1, vec![9])], Vec::new());
        assert!(handler.apply_turn(&turn).is_ok());
    }
}
