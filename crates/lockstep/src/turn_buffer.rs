//! Bounded, ordered store of sealed turns.
//!
//! The buffer retains the window `[min_turn, min_turn + capacity)`. Turns
//! are inserted strictly at `expected_next`; once the window is full the
//! oldest turn is evicted. A consumer that asks for an evicted turn gets
//! [`TurnBufferError::Underrun`] and has to resync.

use std::collections::VecDeque;

use thiserror::Error;
use tracing::trace;

use crate::turn::Turn;
use crate::TurnNumber;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TurnBufferError {
    #[error("turn {actual} inserted out of order, expected {expected}")]
    OutOfOrder {
        expected: TurnNumber,
        actual: TurnNumber,
    },
    #[error("turn {requested} already evicted, oldest retained turn is {min_turn}")]
    Underrun {
        requested: TurnNumber,
        min_turn: TurnNumber,
    },
}

#[derive(Debug, Clone)]
pub struct TurnBuffer {
    capacity: usize,
    turns: VecDeque<Turn>,
    min_turn: TurnNumber,
}

impl TurnBuffer {
    /// Create an empty buffer expecting turn 0 first.
    ///
    /// # Panics
    /// If `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        Self::starting_at(capacity, 0)
    }

    /// Create an empty buffer expecting `first` as its next turn.
    ///
    /// # Panics
    /// If `capacity` is zero.
    pub fn starting_at(capacity: usize, first: TurnNumber) -> Self {
        assert!(capacity > 0, "turn buffer capacity must be positive");
        Self {
            capacity,
            turns: VecDeque::with_capacity(capacity.min(1024)),
            min_turn: first,
        }
    }

    /// Insert the next sealed turn.
    ///
    /// Fails with `OutOfOrder` and leaves the buffer untouched unless
    /// `turn.number() == self.expected_next()`.
    pub fn insert(&mut self, turn: Turn) -> Result<(), TurnBufferError> {
        let expected = self.expected_next();
        if turn.number() != expected {
            return Err(TurnBufferError::OutOfOrder {
                expected,
                actual: turn.number(),
            });
        }

        self.turns.push_back(turn);
        if self.turns.len() > self.capacity {
            if let Some(evicted) = self.turns.pop_front() {
                trace!(turn = evicted.number(), "evicted turn");
            }
            self.min_turn += 1;
        }
        Ok(())
    }

    /// Look up a turn.
    ///
    /// - `Ok(Some(turn))` if the turn is retained
    /// - `Ok(None)` if it has not arrived yet (`number >= expected_next`)
    /// - `Err(Underrun)` if it was already evicted (`number < min_turn`)
    pub fn get(&self, number: TurnNumber) -> Result<Option<&Turn>, TurnBufferError> {
        if number < self.min_turn {
            return Err(TurnBufferError::Underrun {
                requested: number,
                min_turn: self.min_turn,
            });
        }
        let offset = number - self.min_turn;
        Ok(usize::try_from(offset)
            .ok()
            .and_then(|index| self.turns.get(index)))
    }

    /// Retained turns from `from` (clamped to `min_turn`) onwards.
    pub fn turns_from(&self, from: TurnNumber) -> impl Iterator<Item = &Turn> {
        let skip = from.saturating_sub(self.min_turn);
        let skip = usize::try_from(skip).unwrap_or(usize::MAX);
        self.turns.iter().skip(skip)
    }

    /// Drop every retained turn and expect `first` next.
    pub fn reset(&mut self, first: TurnNumber) {
        self.turns.clear();
        self.min_turn = first;
    }

    /// Oldest retained turn number (or the next expected one when empty).
    pub fn min_turn(&self) -> TurnNumber {
        self.min_turn
    }

    /// The only turn number `insert` accepts.
    pub fn expected_next(&self) -> TurnNumber {
        self.min_turn + self.turns.len() as TurnNumber
    }

    pub fn latest(&self) -> Option<&Turn> {
        self.turns.back()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
