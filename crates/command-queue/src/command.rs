//! Application commands and the packet wire format.
//!
//! Request body:
//! `{session_id, watermark, packet_id, timestamp, commands: [{id, name, args, timestamp}], acks?: [<id>]}`
//!
//! Response body:
//! `{watermark?, commands: {<id>: {response?, error?}}, session?: {id}, push?: {commands: {<id>: <payload>}}}`
//!
//! `acks` lists answered command ids and received push command ids, so the
//! backend can drop what it kept for redelivery.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Unit of work delivered to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub args: Value,
    /// Unix seconds at creation.
    pub timestamp: u64,
}

impl Command {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            args,
            timestamp: unix_timestamp(),
        }
    }
}

pub(crate) fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Why a command finished without a response value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    /// The backend answered with an error for this command.
    #[error("rejected by the backend: {0}")]
    Rejected(Value),
    #[error("gave up after {retries} failed sends")]
    RetriesExhausted { retries: u32 },
    #[error("packet failed with HTTP status {status}")]
    Http { status: u16 },
}

/// Name of the command queued by the auto-sync provider.
pub const SYNC_COMMAND_NAME: &str = "sync";

/// Final result of a command: the backend's response value, if any.
pub type CommandResult = Result<Option<Value>, CommandError>;

/// Called exactly once when a command reaches a terminal state. Never called
/// for commands removed or dropped by `dispose`.
pub type FinishCallback = Box<dyn FnOnce(&Command, CommandResult)>;

/// A queued command with its delivery state.
///
/// A command answered while an earlier one is still outstanding keeps its
/// result here until every command added before it has finished.
pub struct PackedCommand {
    pub command: Command,
    /// Failed sends so far.
    pub retries: u32,
    answer: Option<CommandResult>,
    on_finish: Option<FinishCallback>,
}

impl PackedCommand {
    pub(crate) fn new(command: Command, on_finish: Option<FinishCallback>) -> Self {
        Self {
            command,
            retries: 0,
            answer: None,
            on_finish,
        }
    }

    pub fn id(&self) -> Uuid {
        self.command.id
    }

    /// True once the command has a final result waiting to be reported.
    pub fn is_answered(&self) -> bool {
        self.answer.is_some()
    }

    pub(crate) fn set_answer(&mut self, result: CommandResult) {
        self.answer = Some(result);
    }

    /// Report the stored result. No-op for unanswered commands.
    pub(crate) fn release(mut self) {
        if let Some(result) = self.answer.take() {
            self.finish(result);
        }
    }

    pub(crate) fn finish(mut self, result: CommandResult) {
        if let Some(on_finish) = self.on_finish.take() {
            on_finish(&self.command, result);
        }
    }
}

impl fmt::Debug for PackedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackedCommand")
            .field("command", &self.command)
            .field("retries", &self.retries)
            .field("answer", &self.answer)
            .field("has_callback", &self.on_finish.is_some())
            .finish()
    }
}

// ============================================================================
// Packets
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketRequest {
    pub session_id: String,
    pub watermark: u64,
    pub packet_id: u64,
    pub timestamp: u64,
    pub commands: Vec<Command>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CommandOutcome {
    #[serde(default)]
    pub response: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl CommandOutcome {
    pub(crate) fn into_result(self) -> CommandResult {
        match self.error {
            Some(error) if !error.is_null() => Err(CommandError::Rejected(error)),
            _ => Ok(self.response),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionNotice {
    pub id: String,
}

/// Commands the backend pushes to the client, keyed by id.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PushCommands {
    #[serde(default)]
    pub commands: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PacketResponse {
    #[serde(default)]
    pub watermark: Option<u64>,
    /// Keyed by command id.
    #[serde(default)]
    pub commands: HashMap<String, CommandOutcome>,
    #[serde(default)]
    pub session: Option<SessionNotice>,
    #[serde(default)]
    pub push: PushCommands,
}
