//! Read-only client diagnostics.
//!
//! All timings come from the `dt` values passed to `update`; the controller
//! never reads the wall clock.

use std::collections::VecDeque;
use std::time::Duration;

use turnsync_lockstep::TurnNumber;

use crate::ClientState;

/// Snapshot returned by
/// [`ClientLockstepController::diagnostics`](crate::ClientLockstepController::diagnostics).
#[derive(Debug, Clone, PartialEq)]
pub struct ClientDiagnostics {
    pub state: ClientState,
    /// Next turn to be applied.
    pub current_turn: TurnNumber,
    /// Received turns not applied yet.
    pub buffered_turns: u64,
    pub lowest_buffered: u64,
    pub highest_buffered: u64,
    pub average_buffered: f64,
    pub disconnects: u32,
    pub stalls: u32,
    pub stalled_time: Duration,
    /// Mean time between received turns.
    pub average_turn_interval: Option<Duration>,
    pub recovering: bool,
    pub pending_commands: usize,
    pub speed_factor: f64,
}

#[derive(Debug, Clone)]
pub(crate) struct DiagnosticsTracker {
    history_size: usize,
    history: VecDeque<u64>,
    pub(crate) elapsed: Duration,
    pub(crate) disconnects: u32,
    pub(crate) stalls: u32,
    pub(crate) stalled_time: Duration,
    last_received_at: Option<Duration>,
    interval_total: Duration,
    intervals: u32,
}

impl DiagnosticsTracker {
    pub(crate) fn new(history_size: usize) -> Self {
        Self {
            history_size,
            history: VecDeque::with_capacity(history_size),
            elapsed: Duration::ZERO,
            disconnects: 0,
            stalls: 0,
            stalled_time: Duration::ZERO,
            last_received_at: None,
            interval_total: Duration::ZERO,
            intervals: 0,
        }
    }

    pub(crate) fn sample_buffered(&mut self, buffered: u64) {
        if self.history.len() == self.history_size {
            self.history.pop_front();
        }
        self.history.push_back(buffered);
    }

    pub(crate) fn turn_received(&mut self) {
        if let Some(last) = self.last_received_at {
            self.interval_total += self.elapsed - last;
            self.intervals += 1;
        }
        self.last_received_at = Some(self.elapsed);
    }

    /// Forget per-session samples. Counters survive.
    pub(crate) fn reset_session(&mut self) {
        self.history.clear();
        self.last_received_at = None;
    }

    pub(crate) fn lowest(&self) -> u64 {
        self.history.iter().copied().min().unwrap_or(0)
    }

    pub(crate) fn highest(&self) -> u64 {
        self.history.iter().copied().max().unwrap_or(0)
    }

    pub(crate) fn average(&self) -> f64 {
        if self.history.is_empty() {
            return 0.0;
        }
        self.history.iter().sum::<u64>() as f64 / self.history.len() as f64
    }

    pub(crate) fn average_interval(&self) -> Option<Duration> {
        (self.intervals > 0).then(|| self.interval_total / self.intervals)
    }
}
