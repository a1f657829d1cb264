//! turnsync Replay System
//!
//! This crate records the sealed turn stream of a match and verifies or
//! re-applies recorded streams.
//!
//! # Architecture
//!
//! The replay system consists of:
//! - `ReplayRecorder`: Collects sealed turns during a match
//! - `verify_replay`: Checks a `ReplayArtifact` is a gap-free turn stream
//!   whose SHA-256 checksum matches the recorded one
//! - `replay_into`: Feeds a verified stream to any [`TurnHandler`], so a
//!   recorded match can be re-simulated offline

#![deny(unsafe_code)]

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use prost::Message;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};
use turnsync_lockstep::{
    ClientId, LockstepConfig, Turn, TurnApplyError, TurnBuffer, TurnBufferError, TurnHandler,
    TurnNumber,
};
use turnsync_wire::{ReplayArtifact, WireError};

/// Current artifact schema version.
pub const REPLAY_FORMAT_VERSION: u32 = 1;

// ============================================================================
// Turn Stream Checksum
// ============================================================================

/// Chained SHA-256 over the full content of consecutive turns.
#[derive(Clone, Default)]
pub struct TurnStreamHasher {
    hasher: Sha256,
}

impl TurnStreamHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, turn: &Turn) {
        self.hasher.update(turn.number().to_le_bytes());
        self.hasher.update((turn.commands().len() as u64).to_le_bytes());
        for command in turn.commands() {
            self.hasher.update([command.client_id]);
            self.hasher.update(command.seq.to_le_bytes());
            self.hasher.update((command.payload.len() as u64).to_le_bytes());
            self.hasher.update(&command.payload);
        }
        self.hasher.update((turn.delta().len() as u64).to_le_bytes());
        self.hasher.update(turn.delta());
    }

    /// Lowercase hex digest.
    pub fn finish(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }
}

// ============================================================================
// Replay Recorder
// ============================================================================

/// Records sealed turns for replay artifact generation.
pub struct ReplayRecorder {
    config: LockstepConfig,
    first_turn: Option<TurnNumber>,
    turns: Vec<Turn>,
    hasher: TurnStreamHasher,
    player_tokens: Vec<String>,
    random_seed: u64,
}

impl ReplayRecorder {
    pub fn new(config: LockstepConfig) -> Self {
        Self {
            config,
            first_turn: None,
            turns: Vec::new(),
            hasher: TurnStreamHasher::new(),
            player_tokens: Vec::new(),
            random_seed: 0,
        }
    }

    pub fn record_random_seed(&mut self, seed: u64) {
        self.random_seed = seed;
    }

    /// Record the next sealed turn. Turns must be recorded consecutively.
    pub fn record_turn(&mut self, turn: &Turn) -> Result<(), VerifyError> {
        if let Some(first) = self.first_turn {
            let expected = first + self.turns.len() as TurnNumber;
            if turn.number() != expected {
                return Err(VerifyError::TurnStreamInvalid {
                    reason: format!("recorded turn {} but expected {expected}", turn.number()),
                });
            }
        } else {
            self.first_turn = Some(turn.number());
        }
        self.hasher.update(turn);
        self.turns.push(turn.clone());
        Ok(())
    }

    /// Remember the token of the player holding `client_id`.
    pub fn record_player(&mut self, client_id: ClientId, token: &str) {
        let index = usize::from(client_id);
        if self.player_tokens.len() <= index {
            self.player_tokens.resize(index + 1, String::new());
        }
        self.player_tokens[index] = token.to_string();
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Finalize the replay artifact.
    pub fn finalize(self, end_reason: &str) -> ReplayArtifact {
        info!(turns = self.turns.len(), end_reason, "finalizing replay");
        ReplayArtifact {
            replay_format_version: REPLAY_FORMAT_VERSION,
            config: Some(self.config.into()),
            first_turn: self.first_turn.unwrap_or(0),
            turns: self.turns.iter().map(Into::into).collect(),
            turn_stream_sha256: self.hasher.finish(),
            player_tokens: self.player_tokens,
            end_reason: end_reason.to_string(),
            random_seed: self.random_seed,
        }
    }
}

// ============================================================================
// Replay Verification
// ============================================================================

/// Replay verification error.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("unsupported replay format version {version}")]
    UnsupportedVersion { version: u32 },
    #[error("replay artifact has no lockstep config")]
    MissingConfig,
    #[error("invalid replay format: {0}")]
    InvalidFormat(#[from] WireError),
    #[error("turn stream invalid: {reason}")]
    TurnStreamInvalid { reason: String },
    #[error("turn stream checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error(transparent)]
    Apply(#[from] TurnApplyError),
}

impl From<TurnBufferError> for VerifyError {
    fn from(err: TurnBufferError) -> Self {
        Self::TurnStreamInvalid {
            reason: err.to_string(),
        }
    }
}

/// A replay that passed verification.
#[derive(Debug, Clone)]
pub struct VerifiedReplay {
    pub config: LockstepConfig,
    pub turns: Vec<Turn>,
    pub random_seed: u64,
}

impl VerifiedReplay {
    /// Turn number following the last recorded turn.
    pub fn end_turn(&self, first_turn: TurnNumber) -> TurnNumber {
        first_turn + self.turns.len() as TurnNumber
    }
}

/// Verify a replay artifact.
///
/// # Verification Steps:
/// 1. Check the format version
/// 2. Decode and validate the lockstep config
/// 3. Decode every turn and check the stream is consecutive from
///    `first_turn` with no gaps
/// 4. Recompute the turn stream checksum and compare
pub fn verify_replay(artifact: &ReplayArtifact) -> Result<VerifiedReplay, VerifyError> {
    if artifact.replay_format_version != REPLAY_FORMAT_VERSION {
        return Err(VerifyError::UnsupportedVersion {
            version: artifact.replay_format_version,
        });
    }

    let config_proto = artifact.config.clone().ok_or(VerifyError::MissingConfig)?;
    let config = LockstepConfig::try_from(config_proto)?;

    // Reinsertion into a turn buffer enforces the ordering invariant.
    let mut buffer = TurnBuffer::starting_at(artifact.turns.len().max(1), artifact.first_turn);
    let mut hasher = TurnStreamHasher::new();
    let mut turns = Vec::with_capacity(artifact.turns.len());
    for proto in &artifact.turns {
        let turn = Turn::try_from(proto.clone())?;
        hasher.update(&turn);
        buffer.insert(turn.clone())?;
        turns.push(turn);
    }

    let actual = hasher.finish();
    if actual != artifact.turn_stream_sha256 {
        return Err(VerifyError::ChecksumMismatch {
            expected: artifact.turn_stream_sha256.clone(),
            actual,
        });
    }

    debug!(turns = turns.len(), "replay verified");
    Ok(VerifiedReplay {
        config,
        turns,
        random_seed: artifact.random_seed,
    })
}

/// Verify `artifact` and apply every turn to `handler`, simulating
/// `steps_per_turn` simulation steps after each one.
///
/// Returns the turn number following the last applied turn.
pub fn replay_into<H: TurnHandler>(
    artifact: &ReplayArtifact,
    handler: &mut H,
) -> Result<TurnNumber, VerifyError> {
    let replay = verify_replay(artifact)?;
    let step = replay.config.simulation_step();
    for turn in &replay.turns {
        handler.apply_turn(turn)?;
        for _ in 0..replay.config.steps_per_turn() {
            handler.simulate(step);
        }
    }
    Ok(replay.end_turn(artifact.first_turn))
}

// ============================================================================
// Replay I/O
// ============================================================================

/// Write a replay artifact to a file. Never overwrites an existing file.
pub fn write_replay(artifact: &ReplayArtifact, path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let encoded = artifact.encode_to_vec();
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(&encoded)?;

    Ok(())
}

/// Read a replay artifact from a file.
pub fn read_replay(path: &Path) -> io::Result<ReplayArtifact> {
    let data = fs::read(path)?;
    ReplayArtifact::decode(data.as_slice()).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to decode replay: {e}"),
        )
    })
}

// ============================================================================
// Tests
// ============================================================================
