//! turnsync Server Lockstep Loop
//!
//! The server is the single source of truth for turn pacing. It owns:
//! - Session management and player identity (`session`)
//! - Command validation and buffering (`validation`, `command_buffer`)
//! - Turn sealing and broadcast
//! - The authoritative turn buffer used to catch up late joiners
//! - Replay recording
//!
//! # Turn Sealing
//!
//! Every `command_step` the loop seals one turn: buffered commands are
//! drained in deterministic order (ascending client id, then arrival), the
//! [`ServerSimulation`] hook appends its state delta, the turn is pushed into
//! the turn buffer and the same encoded bytes go to every ready client. The
//! loop keeps sealing empty turns when nobody is connected, so a client that
//! joins later fast-forwards deterministically from turn 0.
//!
//! `max_players` gates new connections only; it never stalls the loop.

#![deny(unsafe_code)]

pub mod command_buffer;
pub mod session;
pub mod simulation;
pub mod transport;
pub mod validation;

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace, warn};
use turnsync_lockstep::{
    ClientId, ConfigError, ListenerId, Listeners, LockstepClock, LockstepConfig, Turn, TurnBuffer,
    TurnBufferError, TurnNumber,
};
use turnsync_replay::{ReplayRecorder, VerifyError};
use turnsync_wire::{
    Body, ClientConnectionStatus, ClientSetup, ClientStart, PlayerReady, ReplayArtifact,
    WireError, encode, encode_turns,
};

use command_buffer::CommandBuffer;
use session::{ConnectionId, Player, Session};
pub use simulation::{NoSimulation, ServerSimulation};
pub use transport::{ServerTransport, TransportError};
use validation::{ValidationConfig, ValidationResult, validate_command};

// ============================================================================
// Defaults
// ============================================================================

/// Maximum number of players in a match.
pub const MAX_PLAYERS: u32 = 2;

/// Delay between `start` and the first sealed turn, giving every client time
/// to receive its start message.
pub const CLIENT_START_DELAY_MS: u64 = 3000;

/// How far behind the server clients simulate.
pub const CLIENT_SIMULATION_DELAY_MS: u64 = 1000;

/// Sealed turns retained for catching up late joiners.
pub const TURN_BUFFER_CAPACITY: usize = 1024;

/// Commands accepted per client per turn.
pub const MAX_COMMANDS_PER_TURN: u32 = 16;

/// Largest accepted command payload.
pub const MAX_COMMAND_PAYLOAD_BYTES: usize = 1024;

// ============================================================================
// Configuration
// ============================================================================

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub lockstep: LockstepConfig,
    pub max_players: u32,
    pub client_start_delay_ms: u64,
    pub client_simulation_delay_ms: u64,
    pub turn_buffer_capacity: usize,
    pub max_commands_per_turn: u32,
    pub max_command_payload_bytes: usize,
    /// Start the loop as soon as enough players are ready.
    pub auto_start: bool,
    /// With `auto_start`, a single ready player is enough.
    pub allow_start_with_one_player: bool,
    pub record_replay: bool,
    /// Seed for every peer's random generators. Drawn at construction when
    /// unset.
    pub random_seed: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            lockstep: LockstepConfig::default(),
            max_players: MAX_PLAYERS,
            client_start_delay_ms: CLIENT_START_DELAY_MS,
            client_simulation_delay_ms: CLIENT_SIMULATION_DELAY_MS,
            turn_buffer_capacity: TURN_BUFFER_CAPACITY,
            max_commands_per_turn: MAX_COMMANDS_PER_TURN,
            max_command_payload_bytes: MAX_COMMAND_PAYLOAD_BYTES,
            auto_start: true,
            allow_start_with_one_player: false,
            record_replay: false,
            random_seed: None,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_players == 0 {
            return Err(ConfigError::Zero {
                name: "max_players",
            });
        }
        if self.max_players > u32::from(ClientId::MAX) + 1 {
            return Err(ConfigError::Invalid {
                name: "max_players",
                reason: format!("{} exceeds the client id space", self.max_players),
            });
        }
        if self.turn_buffer_capacity == 0 {
            return Err(ConfigError::Zero {
                name: "turn_buffer_capacity",
            });
        }
        Ok(())
    }

    fn required_ready_players(&self) -> usize {
        if self.allow_start_with_one_player {
            1
        } else {
            self.max_players as usize
        }
    }
}

// ============================================================================
// Errors and Events
// ============================================================================

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server is full ({max_players} players)")]
    Full { max_players: u32 },
    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),
    #[error("connection {0} is unknown")]
    UnknownConnection(ConnectionId),
    #[error("unexpected {0} message from a client")]
    UnexpectedMessage(&'static str),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    TurnBuffer(#[from] TurnBufferError),
    #[error(transparent)]
    Replay(#[from] VerifyError),
}

/// Observable server events.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Started,
    ClientConnected {
        connection: ConnectionId,
    },
    PlayerReady {
        connection: ConnectionId,
        client_id: ClientId,
        reconnect: bool,
    },
    ClientDisconnected {
        connection: ConnectionId,
        client_id: Option<ClientId>,
    },
    TurnSealed {
        number: TurnNumber,
        commands: usize,
    },
    CommandDropped {
        connection: ConnectionId,
        reason: ValidationResult,
    },
}

/// Read-only view of the server state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSnapshot {
    pub running: bool,
    /// Number of the next turn to be sealed.
    pub next_turn: TurnNumber,
    pub min_retained_turn: TurnNumber,
    pub retained_turns: usize,
    pub connections: usize,
    pub ready_players: usize,
    pub known_players: usize,
    pub pending_commands: usize,
}

// ============================================================================
// Server
// ============================================================================

/// Authoritative lockstep loop.
pub struct LockstepServer<T: ServerTransport, S: ServerSimulation = NoSimulation> {
    config: ServerConfig,
    transport: T,
    simulation: S,
    clock: LockstepClock,
    running: bool,
    turns: TurnBuffer,
    commands: CommandBuffer,
    validation: ValidationConfig,
    sessions: HashMap<ConnectionId, Session>,
    /// Players by client id, ordered for deterministic iteration.
    players: BTreeMap<ClientId, Player>,
    recorder: Option<ReplayRecorder>,
    random_seed: u64,
    listeners: Listeners<ServerEvent>,
}

impl<T: ServerTransport> LockstepServer<T, NoSimulation> {
    /// Create a relay-only server.
    pub fn new(config: ServerConfig, transport: T) -> Result<Self, ConfigError> {
        Self::with_simulation(config, transport, NoSimulation)
    }
}

impl<T: ServerTransport, S: ServerSimulation> LockstepServer<T, S> {
    /// Create a server whose turns carry the deltas produced by `simulation`.
    pub fn with_simulation(
        config: ServerConfig,
        transport: T,
        simulation: S,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let clock = LockstepClock::new(config.lockstep.command_step(), 1.0, 0)?;
        let random_seed = config.random_seed.unwrap_or_else(rand::random);
        let recorder = config.record_replay.then(|| {
            let mut recorder = ReplayRecorder::new(config.lockstep);
            recorder.record_random_seed(random_seed);
            recorder
        });

        Ok(Self {
            transport,
            simulation,
            clock,
            running: false,
            turns: TurnBuffer::new(config.turn_buffer_capacity),
            commands: CommandBuffer::new(config.max_commands_per_turn),
            validation: ValidationConfig {
                max_payload_bytes: config.max_command_payload_bytes,
            },
            sessions: HashMap::new(),
            players: BTreeMap::new(),
            recorder,
            random_seed,
            listeners: Listeners::new(),
            config,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Number of the next turn to be sealed.
    pub fn current_turn(&self) -> TurnNumber {
        self.turns.expected_next()
    }

    pub fn turns(&self) -> &TurnBuffer {
        &self.turns
    }

    pub fn simulation(&self) -> &S {
        &self.simulation
    }

    pub fn simulation_mut(&mut self) -> &mut S {
        &mut self.simulation
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Connected sessions, ready or not.
    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn ready_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_ready()).count()
    }

    /// Match seed sent to every client in `ClientStart`.
    pub fn random_seed(&self) -> u64 {
        self.random_seed
    }

    pub fn is_full(&self) -> bool {
        self.sessions.len() >= self.config.max_players as usize
    }

    pub fn add_listener(&mut self, listener: impl FnMut(&ServerEvent) + 'static) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            running: self.running,
            next_turn: self.turns.expected_next(),
            min_retained_turn: self.turns.min_turn(),
            retained_turns: self.turns.len(),
            connections: self.sessions.len(),
            ready_players: self.ready_count(),
            known_players: self.players.len(),
            pending_commands: self.commands.len(),
        }
    }

    // ------------------------------------------------------------------------
    // Loop
    // ------------------------------------------------------------------------

    /// Start sealing turns on `update`, after `client_start_delay_ms`.
    /// No-op if already running.
    pub fn start(&mut self) {
        if self.running {
            return;
        }
        self.running = true;
        let delay = i64::try_from(self.config.client_start_delay_ms).unwrap_or(i64::MAX);
        self.clock.restart(-delay);
        info!(
            next_turn = self.turns.expected_next(),
            start_delay_ms = self.config.client_start_delay_ms,
            "lockstep server started"
        );
        self.listeners.emit(&ServerEvent::Started);
    }

    /// Stop sealing turns. Sessions stay connected.
    pub fn stop(&mut self) {
        if self.running {
            self.running = false;
            info!(next_turn = self.turns.expected_next(), "lockstep server stopped");
        }
    }

    /// Advance server time by `dt` and seal every turn whose interval has
    /// fully elapsed. Returns the number of turns sealed.
    pub fn update(&mut self, dt: Duration) -> Result<usize, ServerError> {
        if !self.running {
            return Ok(0);
        }
        self.clock.advance(dt);
        let mut sealed = 0;
        while self.clock.can_step() {
            self.step()?;
            self.clock.commit_step();
            sealed += 1;
        }
        if sealed > 1 {
            debug!(sealed, "sealed several turns in one update");
        }
        Ok(sealed)
    }

    /// Seal one turn now, without consulting the clock.
    pub fn step(&mut self) -> Result<TurnNumber, ServerError> {
        let number = self.turns.expected_next();
        let commands = self.commands.drain_ordered();
        let delta = self
            .simulation
            .step(number, &commands, self.config.lockstep.command_step());
        let turn = Turn::seal(number, commands, delta);
        let command_count = turn.commands().len();

        if let Some(recorder) = self.recorder.as_mut() {
            recorder.record_turn(&turn)?;
        }

        // Identical bytes for every ready session.
        let messages = encode_turns([&turn]);
        self.turns.insert(turn)?;
        let ready: Vec<ConnectionId> = self
            .sessions
            .values()
            .filter(|s| s.is_ready())
            .map(|s| s.connection)
            .collect();
        for connection in ready {
            for bytes in &messages {
                self.send(connection, bytes);
            }
        }

        trace!(turn = number, commands = command_count, "sealed turn");
        self.listeners.emit(&ServerEvent::TurnSealed {
            number,
            commands: command_count,
        });
        Ok(number)
    }

    /// Server time relative to the first turn, in milliseconds. Negative
    /// while the start delay is still running.
    fn server_time_ms(&self) -> i64 {
        let sealed = self.turns.expected_next() as i64;
        let step = i64::from(self.config.lockstep.command_step_ms());
        sealed * step + self.clock.budget().as_millis() as i64
            - self.clock.delay().as_millis() as i64
    }

    // ------------------------------------------------------------------------
    // Transport entry points
    // ------------------------------------------------------------------------

    /// A transport accepted a new connection.
    ///
    /// Rejected with `Full` once `max_players` connections are open; the
    /// connection is closed in that case.
    pub fn on_client_connected(&mut self, connection: ConnectionId) -> Result<(), ServerError> {
        if self.sessions.contains_key(&connection) {
            return Err(ServerError::DuplicateConnection(connection));
        }
        if self.is_full() {
            warn!(connection, max_players = self.config.max_players, "rejecting connection, server full");
            self.transport.disconnect(connection);
            return Err(ServerError::Full {
                max_players: self.config.max_players,
            });
        }

        self.sessions.insert(connection, Session::new(connection));
        info!(connection, "client connected");

        let setup = encode(Body::ClientSetup(ClientSetup {
            config: Some(self.config.lockstep.into()),
            max_players: self.config.max_players,
        }));
        self.send(connection, &setup);
        self.listeners
            .emit(&ServerEvent::ClientConnected { connection });
        Ok(())
    }

    /// A connection closed. Returns false if it was unknown.
    pub fn on_client_disconnected(&mut self, connection: ConnectionId) -> bool {
        let Some(session) = self.sessions.remove(&connection) else {
            return false;
        };
        let client_id = session.client_id;
        info!(connection, ?client_id, "client disconnected");

        if let Some(id) = client_id {
            if let Some(player) = self.players.get_mut(&id) {
                player.connection = None;
            }
            self.simulation.on_client_disconnected(id);
            self.broadcast_status(id, false);
        }
        self.listeners.emit(&ServerEvent::ClientDisconnected {
            connection,
            client_id,
        });
        true
    }

    /// Handle bytes received on `connection`.
    pub fn on_message_received(
        &mut self,
        connection: ConnectionId,
        bytes: &[u8],
    ) -> Result<(), ServerError> {
        match turnsync_wire::decode(bytes)? {
            Body::PlayerReady(ready) => self.on_player_ready(connection, ready),
            Body::Command(command) => {
                let result = self.receive_command(connection, command);
                if !result.is_accepted() {
                    debug!(connection, ?result, "dropped command");
                    self.listeners.emit(&ServerEvent::CommandDropped {
                        connection,
                        reason: result,
                    });
                }
                Ok(())
            }
            Body::Turn(_) => Err(ServerError::UnexpectedMessage("Turn")),
            Body::EmptyTurns(_) => Err(ServerError::UnexpectedMessage("EmptyTurns")),
            Body::ClientSetup(_) => Err(ServerError::UnexpectedMessage("ClientSetup")),
            Body::ClientStart(_) => Err(ServerError::UnexpectedMessage("ClientStart")),
            Body::ConnectionStatus(_) => Err(ServerError::UnexpectedMessage("ConnectionStatus")),
        }
    }

    /// Validate a command and buffer it for the next turn.
    pub fn receive_command(
        &mut self,
        connection: ConnectionId,
        command: turnsync_wire::CommandProto,
    ) -> ValidationResult {
        let session = self.sessions.get(&connection);
        let player = session
            .and_then(|s| s.client_id)
            .and_then(|id| self.players.get_mut(&id));
        validate_command(
            command,
            session,
            player,
            &mut self.commands,
            &self.validation,
        )
    }

    fn on_player_ready(
        &mut self,
        connection: ConnectionId,
        ready: PlayerReady,
    ) -> Result<(), ServerError> {
        if !self.sessions.contains_key(&connection) {
            return Err(ServerError::UnknownConnection(connection));
        }

        let existing = self
            .players
            .values()
            .find(|p| p.token == ready.player_token)
            .map(|p| p.client_id);
        let reconnect = existing.is_some();
        let client_id = match existing.or_else(|| self.lowest_free_client_id()) {
            Some(id) => id,
            None => {
                // Every client id belongs to a known player; this connection
                // can never join.
                warn!(connection, "refusing player, every client id is taken");
                self.sessions.remove(&connection);
                self.transport.disconnect(connection);
                self.listeners.emit(&ServerEvent::ClientDisconnected {
                    connection,
                    client_id: None,
                });
                return Err(ServerError::Full {
                    max_players: self.config.max_players,
                });
            }
        };

        let joined_at = self.turns.expected_next();
        let player = self
            .players
            .entry(client_id)
            .or_insert_with(|| Player::new(client_id, ready.player_token.clone(), connection, joined_at));
        let mut stale_connection = None;
        if reconnect {
            stale_connection = player.connection.filter(|c| *c != connection);
            player.connection = Some(connection);
            player.reconnects += 1;
        }
        if let Some(previous) = stale_connection {
            warn!(client_id, previous, connection, "player took over from a stale connection");
            self.sessions.remove(&previous);
            self.transport.disconnect(previous);
        }
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.record_player(client_id, &ready.player_token);
        }
        if let Some(session) = self.sessions.get_mut(&connection) {
            session.client_id = Some(client_id);
        }

        info!(
            connection,
            client_id,
            reconnect,
            current_turn = ready.current_turn,
            "player ready"
        );

        let start = encode(Body::ClientStart(ClientStart {
            start_offset_ms: self.client_start_offset_ms(),
            client_id: u32::from(client_id),
            player_tokens: self.player_tokens(),
            random_seed: self.random_seed,
        }));
        self.send(connection, &start);
        self.send_backlog(connection, ready.current_turn);

        self.simulation.on_client_connected(client_id);
        self.broadcast_status(client_id, true);
        self.listeners.emit(&ServerEvent::PlayerReady {
            connection,
            client_id,
            reconnect,
        });

        if !self.running
            && self.config.auto_start
            && self.ready_count() >= self.config.required_ready_players()
        {
            self.start();
        }
        Ok(())
    }

    /// Offset the client's clock starts at: server time minus the client
    /// simulation delay.
    fn client_start_offset_ms(&self) -> i64 {
        let delay = i64::try_from(self.config.client_simulation_delay_ms).unwrap_or(i64::MAX);
        self.server_time_ms() - delay
    }

    fn send_backlog(&mut self, connection: ConnectionId, from: TurnNumber) {
        if from < self.turns.min_turn() {
            warn!(
                connection,
                requested = from,
                min_turn = self.turns.min_turn(),
                "client is behind the retained turns and will need a resync"
            );
        }
        let messages = encode_turns(self.turns.turns_from(from));
        debug!(connection, from, messages = messages.len(), "sending turn backlog");
        for bytes in &messages {
            self.send(connection, bytes);
        }
    }

    fn broadcast_status(&mut self, client_id: ClientId, connected: bool) {
        let bytes = encode(Body::ConnectionStatus(ClientConnectionStatus {
            client_id: u32::from(client_id),
            connected,
        }));
        let others: Vec<ConnectionId> = self
            .sessions
            .values()
            .filter(|s| s.is_ready() && s.client_id != Some(client_id))
            .map(|s| s.connection)
            .collect();
        for connection in others {
            self.send(connection, &bytes);
        }
    }

    fn lowest_free_client_id(&self) -> Option<ClientId> {
        (0..self.config.max_players)
            .filter_map(|id| ClientId::try_from(id).ok())
            .find(|id| !self.players.contains_key(id))
    }

    fn player_tokens(&self) -> Vec<String> {
        let Some(max_id) = self.players.keys().next_back() else {
            return Vec::new();
        };
        let mut tokens = vec![String::new(); usize::from(*max_id) + 1];
        for player in self.players.values() {
            tokens[usize::from(player.client_id)] = player.token.clone();
        }
        tokens
    }

    fn send(&mut self, connection: ConnectionId, bytes: &[u8]) {
        if let Err(err) = self.transport.send_to(connection, bytes) {
            warn!(connection, %err, "send failed");
        }
    }

    // ------------------------------------------------------------------------
    // Replay
    // ------------------------------------------------------------------------

    /// Finish recording and return the artifact. `None` unless
    /// `record_replay` is enabled; recording stops afterwards.
    pub fn finalize_replay(&mut self, end_reason: &str) -> Option<ReplayArtifact> {
        self.recorder
            .take()
            .map(|recorder| recorder.finalize(end_reason))
    }
}

// ============================================================================
// Tests
// ============================================================================
