//! turnsync Wire Protocol Types
//!
//! Shared Protobuf message types exchanged between the client lockstep
//! controller and the server lockstep loop. Both sides MUST depend on this
//! crate so their schemas cannot drift.
//!
//! # Message Categories
//!
//! - **Handshake**: `ClientSetup` (server → client, negotiated config),
//!   `PlayerReady` (client → server), `ClientStart` (server → client)
//! - **Turn stream**: `TurnProto` and `EmptyTurns` (server → client),
//!   `CommandProto` (client → server)
//! - **Presence**: `ClientConnectionStatus` (server → client)
//!
//! Every lockstep message travels inside an [`Envelope`]. Scene deltas and
//! replay artifacts are standalone messages.

#![deny(unsafe_code)]

use prost::Message;
use thiserror::Error;
use turnsync_lockstep::{ClientId, Command, ConfigError, LockstepConfig, Turn, TurnNumber};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("envelope has no body")]
    MissingBody,
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ============================================================================
// Turn Stream Messages
// ============================================================================

/// Simulation command.
///
/// `client_id` is ignored by the server on receipt (it binds the id from the
/// session) and filled in when the command is echoed inside a turn.
#[derive(Clone, PartialEq, Message)]
pub struct CommandProto {
    #[prost(uint32, tag = "1")]
    pub client_id: u32,

    #[prost(uint64, tag = "2")]
    pub seq: u64,

    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

/// A sealed turn.
#[derive(Clone, PartialEq, Message)]
pub struct TurnProto {
    #[prost(uint64, tag = "1")]
    pub number: TurnNumber,

    /// Commands in their sealed order.
    #[prost(message, repeated, tag = "2")]
    pub commands: Vec<CommandProto>,

    /// State delta appended by the server, empty when none.
    #[prost(bytes = "vec", tag = "3")]
    pub delta: Vec<u8>,
}

/// A run of `count` empty turns starting at `first`.
#[derive(Clone, PartialEq, Message)]
pub struct EmptyTurns {
    #[prost(uint64, tag = "1")]
    pub first: TurnNumber,

    #[prost(uint32, tag = "2")]
    pub count: u32,
}

// ============================================================================
// Handshake Messages
// ============================================================================

#[derive(Clone, PartialEq, Message)]
pub struct LockstepConfigProto {
    #[prost(uint32, tag = "1")]
    pub command_step_ms: u32,

    #[prost(uint32, tag = "2")]
    pub simulation_step_ms: u32,
}

/// Sent by the server as soon as a connection is accepted.
#[derive(Clone, PartialEq, Message)]
pub struct ClientSetup {
    #[prost(message, optional, tag = "1")]
    pub config: Option<LockstepConfigProto>,

    #[prost(uint32, tag = "2")]
    pub max_players: u32,
}

/// Sent by the client once it accepted the setup.
#[derive(Clone, PartialEq, Message)]
pub struct PlayerReady {
    /// Stable token identifying the player across reconnects.
    #[prost(string, tag = "1")]
    pub player_token: String,

    /// First turn the client still needs.
    #[prost(uint64, tag = "2")]
    pub current_turn: TurnNumber,
}

/// Sent by the server when the client may start simulating.
#[derive(Clone, PartialEq, Message)]
pub struct ClientStart {
    /// Server time minus client simulation delay, in milliseconds. Negative
    /// values delay the client's first step; positive values are owed time
    /// the client fast-forwards through.
    #[prost(sint64, tag = "1")]
    pub start_offset_ms: i64,

    /// Lockstep id assigned to this client.
    #[prost(uint32, tag = "2")]
    pub client_id: u32,

    /// Tokens of every ready player, indexed by client id.
    #[prost(string, repeated, tag = "3")]
    pub player_tokens: Vec<String>,

    /// Match seed for every peer's random generators.
    #[prost(uint64, tag = "4")]
    pub random_seed: u64,
}

/// Another player's connection changed.
#[derive(Clone, PartialEq, Message)]
pub struct ClientConnectionStatus {
    #[prost(uint32, tag = "1")]
    pub client_id: u32,

    #[prost(bool, tag = "2")]
    pub connected: bool,
}

// ============================================================================
// Envelope
// ============================================================================

#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    #[prost(oneof = "envelope::Body", tags = "1, 2, 3, 4, 5, 6, 7")]
    pub body: Option<envelope::Body>,
}

pub mod envelope {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "1")]
        Command(super::CommandProto),
        #[prost(message, tag = "2")]
        Turn(super::TurnProto),
        #[prost(message, tag = "3")]
        EmptyTurns(super::EmptyTurns),
        #[prost(message, tag = "4")]
        ClientSetup(super::ClientSetup),
        #[prost(message, tag = "5")]
        PlayerReady(super::PlayerReady),
        #[prost(message, tag = "6")]
        ClientStart(super::ClientStart),
        #[prost(message, tag = "7")]
        ConnectionStatus(super::ClientConnectionStatus),
    }
}

pub use envelope::Body;

/// Encode a lockstep message.
pub fn encode(body: Body) -> Vec<u8> {
    Envelope { body: Some(body) }.encode_to_vec()
}

/// Decode a lockstep message.
pub fn decode(bytes: &[u8]) -> Result<Body, WireError> {
    Envelope::decode(bytes)?.body.ok_or(WireError::MissingBody)
}

/// Encode a sequence of consecutive turns for sending.
///
/// Runs of empty turns collapse into a single `EmptyTurns` message; turns
/// with commands or a delta are sent as `TurnProto`.
pub fn encode_turns<'a>(turns: impl IntoIterator<Item = &'a Turn>) -> Vec<Vec<u8>> {
    let mut messages = Vec::new();
    let mut run: Option<EmptyTurns> = None;

    for turn in turns {
        if turn.is_empty() {
            match run.as_mut() {
                Some(r) if r.first + u64::from(r.count) == turn.number() && r.count < u32::MAX => {
                    r.count += 1;
                }
                _ => {
                    if let Some(r) = run.take() {
                        messages.push(encode(Body::EmptyTurns(r)));
                    }
                    run = Some(EmptyTurns {
                        first: turn.number(),
                        count: 1,
                    });
                }
            }
        } else {
            if let Some(r) = run.take() {
                messages.push(encode(Body::EmptyTurns(r)));
            }
            messages.push(encode(Body::Turn(turn.into())));
        }
    }
    if let Some(r) = run {
        messages.push(encode(Body::EmptyTurns(r)));
    }
    messages
}

impl EmptyTurns {
    /// Expand into the individual empty turns.
    pub fn turns(&self) -> impl Iterator<Item = Turn> {
        let first = self.first;
        (0..u64::from(self.count)).map(move |i| Turn::empty(first + i))
    }
}

// ============================================================================
// Conversion Traits
// ============================================================================

impl From<&Command> for CommandProto {
    fn from(c: &Command) -> Self {
        Self {
            client_id: u32::from(c.client_id),
            seq: c.seq,
            payload: c.payload.clone(),
        }
    }
}

impl TryFrom<CommandProto> for Command {
    type Error = WireError;

    fn try_from(c: CommandProto) -> Result<Self, Self::Error> {
        let client_id = client_id_from_wire(c.client_id)?;
        Ok(Command::new(client_id, c.seq, c.payload))
    }
}

impl From<&Turn> for TurnProto {
    fn from(t: &Turn) -> Self {
        Self {
            number: t.number(),
            commands: t.commands().iter().map(Into::into).collect(),
            delta: t.delta().to_vec(),
        }
    }
}

impl TryFrom<TurnProto> for Turn {
    type Error = WireError;

    fn try_from(t: TurnProto) -> Result<Self, Self::Error> {
        let commands = t
            .commands
            .into_iter()
            .map(Command::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Turn::seal(t.number, commands, t.delta))
    }
}

impl From<LockstepConfig> for LockstepConfigProto {
    fn from(c: LockstepConfig) -> Self {
        Self {
            command_step_ms: c.command_step_ms(),
            simulation_step_ms: c.simulation_step_ms(),
        }
    }
}

impl TryFrom<LockstepConfigProto> for LockstepConfig {
    type Error = WireError;

    fn try_from(c: LockstepConfigProto) -> Result<Self, Self::Error> {
        Ok(LockstepConfig::new(c.command_step_ms, c.simulation_step_ms)?)
    }
}

/// Narrow a wire client id to [`ClientId`].
pub fn client_id_from_wire(value: u32) -> Result<ClientId, WireError> {
    ClientId::try_from(value).map_err(|_| WireError::Invalid {
        field: "client_id",
        reason: format!("{value} does not fit a client id"),
    })
}

// ============================================================================
// Scene Delta Messages
// ============================================================================

#[derive(Clone, PartialEq, Message)]
pub struct TransformProto {
    /// Position [x, y, z].
    #[prost(double, repeated, tag = "1")]
    pub position: Vec<f64>,

    /// Rotation around the vertical axis, radians.
    #[prost(double, tag = "2")]
    pub rotation: f64,
}

#[derive(Clone, PartialEq, Message)]
pub struct EntitySpawnProto {
    #[prost(uint32, tag = "1")]
    pub entity_id: u32,

    /// Application-defined object type.
    #[prost(uint32, tag = "2")]
    pub kind: u32,

    #[prost(message, optional, tag = "3")]
    pub transform: Option<TransformProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct EntityUpdateProto {
    #[prost(uint32, tag = "1")]
    pub entity_id: u32,

    #[prost(message, optional, tag = "2")]
    pub transform: Option<TransformProto>,
}

/// Scene changes produced during one turn, ordered by entity id.
#[derive(Clone, PartialEq, Message)]
pub struct SceneDeltaProto {
    #[prost(message, repeated, tag = "1")]
    pub spawned: Vec<EntitySpawnProto>,

    #[prost(message, repeated, tag = "2")]
    pub updated: Vec<EntityUpdateProto>,

    #[prost(uint32, repeated, tag = "3")]
    pub despawned: Vec<u32>,
}

// ============================================================================
// Replay Artifact
// ============================================================================

/// Recorded turn log of one match.
#[derive(Clone, PartialEq, Message)]
pub struct ReplayArtifact {
    /// Schema version (starts at 1).
    #[prost(uint32, tag = "1")]
    pub replay_format_version: u32,

    #[prost(message, optional, tag = "2")]
    pub config: Option<LockstepConfigProto>,

    /// Number of the first recorded turn.
    #[prost(uint64, tag = "3")]
    pub first_turn: TurnNumber,

    /// Consecutive sealed turns starting at `first_turn`.
    #[prost(message, repeated, tag = "4")]
    pub turns: Vec<TurnProto>,

    /// Hex SHA-256 over the content of every recorded turn, in order.
    #[prost(string, tag = "5")]
    pub turn_stream_sha256: String,

    /// Tokens of the players, indexed by client id.
    #[prost(string, repeated, tag = "6")]
    pub player_tokens: Vec<String>,

    #[prost(string, tag = "7")]
    pub end_reason: String,

    /// Match seed the players' random generators were created from.
    #[prost(uint64, tag = "8")]
    pub random_seed: u64,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let msg = Body::PlayerReady(PlayerReady {
            player_token: "p-1".to_string(),
            current_turn: 12,
        });
        let bytes = encode(msg.clone());
        assert_eq!(decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_empty_envelope_rejected() {
        let bytes = Envelope { body: None }.encode_to_vec();
        assert!(matches!(decode(&bytes), Err(WireError::MissingBody)));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            decode(&[0xff, 0xff, 0xff]),
            Err(WireError::Decode(_))
        ));
    }

    #[test]
    fn test_turn_conversion_preserves_order() {
        let turn = Turn::seal(
            5,
            vec![Command::new(0, 3, b"a".to_vec()), Command::new(2, 1, b"b".to_vec())],
            vec![1, 2, 3],
        );
        let proto = TurnProto::from(&turn);
        assert_eq!(proto.commands[1].client_id, 2);

        let back = Turn::try_from(proto).unwrap();
        assert_eq!(back, turn);
        assert_eq!(back.digest(), turn.digest());
    }

    #[test]
    fn test_command_client_id_out_of_range() {
        let proto = CommandProto {
            client_id: 300,
            seq: 1,
            payload: Vec::new(),
        };
        assert!(matches!(
            Command::try_from(proto),
            Err(WireError::Invalid {
                field: "client_id",
                ..
            })
        ));
    }

    #[test]
    fn test_config_proto_validated() {
        let bad = LockstepConfigProto {
            command_step_ms: 100,
            simulation_step_ms: 0,
        };
        assert!(matches!(
            LockstepConfig::try_from(bad),
            Err(WireError::Config(ConfigError::Zero { .. }))
        ));

        let good = LockstepConfig::new(100, 50).unwrap();
        let back = LockstepConfig::try_from(LockstepConfigProto::from(good)).unwrap();
        assert_eq!(back, good);
    }

    #[test]
    fn test_encode_turns_collapses_empty_runs() {
        let turns = vec![
            Turn::empty(0),
            Turn::empty(1),
            Turn::empty(2),
            Turn::seal(3, vec![Command::new(1, 1, vec![7])], Vec::new()),
            Turn::empty(4),
        ];
        let messages: Vec<Body> = encode_turns(&turns)
            .iter()
            .map(|bytes| decode(bytes).unwrap())
            .collect();

        assert_eq!(messages.len(), 3);
        assert_eq!(
            messages[0],
            Body::EmptyTurns(EmptyTurns { first: 0, count: 3 })
        );
        assert!(matches!(&messages[1], Body::Turn(t) if t.number == 3));
        assert_eq!(
            messages[2],
            Body::EmptyTurns(EmptyTurns { first: 4, count: 1 })
        );
    }

    #[test]
    fn test_empty_turns_expand() {
        let run = EmptyTurns { first: 10, count: 3 };
        let numbers: Vec<_> = run.turns().map(|t| t.number()).collect();
        assert_eq!(numbers, vec![10, 11, 12]);
        assert!(run.turns().all(|t| t.is_empty()));
    }

    #[test]
    fn test_scene_delta_roundtrip() {
        let msg = SceneDeltaProto {
            spawned: vec![EntitySpawnProto {
                entity_id: 1,
                kind: 4,
                transform: Some(TransformProto {
                    position: vec![1.0, 0.0, -2.5],
                    rotation: 0.5,
                }),
            }],
            updated: vec![],
            despawned: vec![3],
        };
        let encoded = msg.encode_to_vec();
        let decoded = SceneDeltaProto::decode(encoded.as_slice()).unwrap();
        assert_eq!(msg, decoded);
    }
}
