//! turnsync Client Lockstep Controller
//!
//! Drives a [`TurnHandler`] through the turns sealed by the server. The
//! controller owns:
//! - The connection state machine and the handshake
//! - A local [`TurnBuffer`] fed by the transport
//! - A [`LockstepClock`] paced by the `dt` passed to `update`
//! - Sequencing and confirmation of the local player's commands
//!
//! # State Machine
//!
//! ```text
//! Disconnected -> Connecting -> WaitingForStart -> Running -> Stopped
//!       ^______________|_______________|______________|
//!                 transport failure
//! ```
//!
//! `connect` leaves `Disconnected` or `Stopped`; `on_connected` moves to
//! `WaitingForStart`; the first sealed turn starts the clock and moves to
//! `Running`. `disconnect` and fatal errors end in `Stopped`.
//!
//! # Stalls
//!
//! On every turn boundary the next turn must already be buffered. If it is
//! not, the controller stops stepping for this update, keeps its time budget
//! and resumes on a later update once the turn arrives.

#![deny(unsafe_code)]

pub mod config;
pub mod diagnostics;
pub mod transport;

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};
use turnsync_lockstep::{
    ClientId, CommandSeq, ConfigError, ListenerId, Listeners, LockstepClock, LockstepConfig,
    LockstepRng, RandomRoot, Turn, TurnApplyError, TurnBuffer, TurnBufferError, TurnHandler,
    TurnNumber,
};
use turnsync_wire::{
    Body, ClientSetup, ClientStart, CommandProto, PlayerReady, WireError, client_id_from_wire,
    decode, encode,
};

pub use config::ClientConfig;
pub use diagnostics::ClientDiagnostics;
use diagnostics::DiagnosticsTracker;
pub use transport::{ClientTransport, TransportError};

// ============================================================================
// State, Errors and Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Disconnected,
    Connecting,
    WaitingForStart,
    Running,
    Stopped,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::WaitingForStart => "waiting for start",
            Self::Running => "running",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Why the controller stopped and needs a full resync.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResyncReason {
    #[error(transparent)]
    TurnBuffer(#[from] TurnBufferError),
    #[error(transparent)]
    ApplyFailed(#[from] TurnApplyError),
    #[error("turn {turn} handler panicked: {message}")]
    ApplyPanicked { turn: TurnNumber, message: String },
    #[error(transparent)]
    ConfigMismatch(ConfigError),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is not connected")]
    NotConnected,
    #[error("unexpected {0} message from the server")]
    UnexpectedMessage(&'static str),
    #[error("resync required: {0}")]
    Resync(ResyncReason),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StateChanged {
        from: ClientState,
        to: ClientState,
    },
    /// The clock was (re)started; `offset_ms` is where it started relative to
    /// the first turn not yet simulated.
    Started {
        client_id: Option<ClientId>,
        offset_ms: i64,
    },
    TurnApplied {
        number: TurnNumber,
    },
    /// A command sent by this client was applied as part of `turn`.
    CommandConfirmed {
        seq: CommandSeq,
        turn: TurnNumber,
    },
    /// Turn `turn` is due but has not arrived.
    Stalled {
        turn: TurnNumber,
    },
    Resumed {
        turn: TurnNumber,
        stalled_for: Duration,
    },
    PeerConnection {
        client_id: ClientId,
        connected: bool,
    },
    NeedsResync {
        reason: ResyncReason,
    },
}

// ============================================================================
// Controller
// ============================================================================

pub struct ClientLockstepController<T: ClientTransport> {
    config: ClientConfig,
    transport: T,
    state: ClientState,
    clock: LockstepClock,
    turns: TurnBuffer,
    /// Simulation steps run since turn 0.
    sim_step: u64,
    /// Next turn to apply.
    next_turn: TurnNumber,
    client_id: Option<ClientId>,
    player_tokens: Vec<String>,
    start_offset_ms: Option<i64>,
    random: Option<RandomRoot>,
    /// Never reset, so the server never sees a sequence twice.
    next_seq: CommandSeq,
    pending: BTreeSet<CommandSeq>,
    stalled_since: Option<Duration>,
    diagnostics: DiagnosticsTracker,
    listeners: Listeners<ClientEvent>,
}

impl<T: ClientTransport> ClientLockstepController<T> {
    pub fn new(config: ClientConfig, transport: T) -> Result<Self, ConfigError> {
        config.validate()?;
        let clock = LockstepClock::new(
            config.lockstep.simulation_step(),
            config.speed_factor,
            config.max_simulation_steps_per_frame,
        )?;
        Ok(Self {
            transport,
            state: ClientState::Disconnected,
            clock,
            turns: TurnBuffer::new(config.turn_buffer_capacity),
            sim_step: 0,
            next_turn: 0,
            client_id: None,
            player_tokens: Vec::new(),
            start_offset_ms: None,
            random: None,
            next_seq: 1,
            pending: BTreeSet::new(),
            stalled_since: None,
            diagnostics: DiagnosticsTracker::new(config.diagnostics_history_size),
            listeners: Listeners::new(),
            config,
        })
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn lockstep_config(&self) -> &LockstepConfig {
        &self.config.lockstep
    }

    /// Next turn to be applied.
    pub fn current_turn(&self) -> TurnNumber {
        self.next_turn
    }

    /// Assigned by the server in `ClientStart`.
    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    /// Tokens of all players, indexed by client id.
    pub fn player_tokens(&self) -> &[String] {
        &self.player_tokens
    }

    /// Match seed from `ClientStart`.
    pub fn random_seed(&self) -> Option<u64> {
        self.random.as_ref().map(RandomRoot::seed)
    }

    /// Next match-seeded generator. Peers that create generators in the
    /// same order get the same sequences. `None` before `ClientStart`.
    pub fn create_random_generator(&mut self) -> Option<LockstepRng> {
        self.random.as_mut().map(RandomRoot::create_generator)
    }

    pub fn player_token(&self) -> &str {
        &self.config.player_token
    }

    pub fn local_simulation_delay(&self) -> Duration {
        Duration::from_millis(self.config.local_simulation_delay_ms)
    }

    pub fn speed_factor(&self) -> f64 {
        self.clock.speed_factor()
    }

    pub fn set_speed_factor(&mut self, speed_factor: f64) -> Result<(), ConfigError> {
        self.clock.set_speed_factor(speed_factor)?;
        self.config.speed_factor = speed_factor;
        Ok(())
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled_since.is_some()
    }

    pub fn turns(&self) -> &TurnBuffer {
        &self.turns
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn add_listener(&mut self, listener: impl FnMut(&ClientEvent) + 'static) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn diagnostics(&self) -> ClientDiagnostics {
        let tracker = &self.diagnostics;
        let stalled_time = match self.stalled_since {
            Some(since) => tracker.stalled_time + (tracker.elapsed - since),
            None => tracker.stalled_time,
        };
        ClientDiagnostics {
            state: self.state,
            current_turn: self.next_turn,
            buffered_turns: self.buffered_turns(),
            lowest_buffered: tracker.lowest(),
            highest_buffered: tracker.highest(),
            average_buffered: tracker.average(),
            disconnects: tracker.disconnects,
            stalls: tracker.stalls,
            stalled_time,
            average_turn_interval: tracker.average_interval(),
            recovering: self.clock.is_recovering(),
            pending_commands: self.pending.len(),
            speed_factor: self.clock.speed_factor(),
        }
    }

    fn buffered_turns(&self) -> u64 {
        self.turns.expected_next().saturating_sub(self.next_turn)
    }

    // ------------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------------

    /// Start connecting. No-op unless `Disconnected` or `Stopped`; from
    /// `Stopped` all turn progress is discarded first.
    pub fn connect(&mut self) {
        match self.state {
            ClientState::Disconnected => {}
            ClientState::Stopped => self.reset_progress(),
            _ => return,
        }
        self.set_state(ClientState::Connecting);
        self.transport.connect();
    }

    /// Stop the session. No-op if already `Stopped`.
    pub fn disconnect(&mut self) {
        if self.state == ClientState::Stopped {
            return;
        }
        self.transport.disconnect();
        self.set_state(ClientState::Stopped);
    }

    /// Transport finished connecting.
    pub fn on_connected(&mut self) {
        if self.state != ClientState::Connecting {
            warn!(state = %self.state, "ignoring connected notification");
            return;
        }
        self.set_state(ClientState::WaitingForStart);
    }

    /// Transport lost the connection.
    pub fn on_disconnected(&mut self) {
        if matches!(self.state, ClientState::Stopped | ClientState::Disconnected) {
            return;
        }
        self.diagnostics.disconnects += 1;
        self.set_state(ClientState::Disconnected);
    }

    pub fn on_error(&mut self, reason: &str) {
        warn!(state = %self.state, reason, "transport error");
        self.on_disconnected();
    }

    fn reset_progress(&mut self) {
        debug!(current_turn = self.next_turn, "discarding turn progress");
        self.turns = TurnBuffer::new(self.config.turn_buffer_capacity);
        self.sim_step = 0;
        self.next_turn = 0;
        self.client_id = None;
        self.player_tokens.clear();
        self.start_offset_ms = None;
        self.random = None;
        self.pending.clear();
        self.stalled_since = None;
        self.clock.restart(0);
        self.diagnostics.reset_session();
    }

    fn set_state(&mut self, to: ClientState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        info!(%from, %to, "client state changed");
        self.listeners.emit(&ClientEvent::StateChanged { from, to });
    }

    /// Stop with a resync request.
    fn fail(&mut self, reason: ResyncReason) -> ClientError {
        error!(%reason, turn = self.next_turn, "lockstep desync, resync required");
        self.transport.disconnect();
        self.set_state(ClientState::Stopped);
        self.listeners.emit(&ClientEvent::NeedsResync {
            reason: reason.clone(),
        });
        ClientError::Resync(reason)
    }

    // ------------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------------

    /// Handle bytes received from the server.
    pub fn on_message_received(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        let body = decode(bytes)?;
        if self.state == ClientState::Stopped {
            debug!("ignoring message while stopped");
            return Ok(());
        }
        match body {
            Body::ClientSetup(setup) => self.on_setup(setup),
            Body::ClientStart(start) => self.on_start(start),
            Body::Turn(proto) => {
                let turn = Turn::try_from(proto)?;
                self.receive_turn(turn)
            }
            Body::EmptyTurns(run) => {
                for turn in run.turns() {
                    self.receive_turn(turn)?;
                }
                Ok(())
            }
            Body::ConnectionStatus(status) => {
                let client_id = client_id_from_wire(status.client_id)?;
                info!(client_id, connected = status.connected, "peer connection changed");
                self.listeners.emit(&ClientEvent::PeerConnection {
                    client_id,
                    connected: status.connected,
                });
                Ok(())
            }
            Body::Command(_) => Err(ClientError::UnexpectedMessage("Command")),
            Body::PlayerReady(_) => Err(ClientError::UnexpectedMessage("PlayerReady")),
        }
    }

    fn on_setup(&mut self, setup: ClientSetup) -> Result<(), ClientError> {
        let remote = setup.config.ok_or(WireError::Invalid {
            field: "config",
            reason: "missing from setup".to_string(),
        })?;
        let remote = match LockstepConfig::try_from(remote) {
            Ok(remote) => remote,
            Err(WireError::Config(err)) => return Err(self.fail(ResyncReason::ConfigMismatch(err))),
            Err(err) => return Err(err.into()),
        };
        if let Err(err) = self.config.lockstep.ensure_matches(&remote) {
            return Err(self.fail(ResyncReason::ConfigMismatch(err)));
        }

        let current_turn = self.turns.expected_next();
        debug!(current_turn, max_players = setup.max_players, "config accepted, sending ready");
        let ready = encode(Body::PlayerReady(PlayerReady {
            player_token: self.config.player_token.clone(),
            current_turn,
        }));
        self.transport.send(ready)?;
        Ok(())
    }

    fn on_start(&mut self, start: ClientStart) -> Result<(), ClientError> {
        let client_id = client_id_from_wire(start.client_id)?;
        info!(client_id, offset_ms = start.start_offset_ms, "received start");
        self.client_id = Some(client_id);
        self.start_offset_ms = Some(start.start_offset_ms);
        self.player_tokens = start.player_tokens;
        self.random = Some(RandomRoot::new(start.random_seed));
        Ok(())
    }

    fn receive_turn(&mut self, turn: Turn) -> Result<(), ClientError> {
        let number = turn.number();
        if number < self.turns.expected_next() {
            trace!(turn = number, "ignoring duplicate turn");
            return Ok(());
        }
        if let Err(err) = self.turns.insert(turn) {
            return Err(self.fail(err.into()));
        }
        self.diagnostics.turn_received();
        trace!(turn = number, "received turn");

        if self.state == ClientState::WaitingForStart {
            self.begin_running();
        }
        Ok(())
    }

    fn begin_running(&mut self) {
        let local_delay = i64::try_from(self.config.local_simulation_delay_ms).unwrap_or(i64::MAX);
        let target = self.start_offset_ms.unwrap_or(-local_delay);
        // Offsets are relative to turn 0; discount steps already simulated.
        let simulated = self
            .sim_step
            .saturating_mul(u64::from(self.config.lockstep.simulation_step_ms()));
        let offset_ms = target.saturating_sub(i64::try_from(simulated).unwrap_or(i64::MAX));
        self.clock.restart(offset_ms);
        self.set_state(ClientState::Running);
        self.listeners.emit(&ClientEvent::Started {
            client_id: self.client_id,
            offset_ms,
        });
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Send a command for the next turn. Returns its sequence number; a
    /// `CommandConfirmed` event follows once the turn carrying it is applied.
    pub fn add_command(&mut self, payload: impl Into<Vec<u8>>) -> Result<CommandSeq, ClientError> {
        if !matches!(
            self.state,
            ClientState::WaitingForStart | ClientState::Running
        ) {
            return Err(ClientError::NotConnected);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let bytes = encode(Body::Command(CommandProto {
            client_id: self.client_id.map(u32::from).unwrap_or_default(),
            seq,
            payload: payload.into(),
        }));
        self.transport.send(bytes)?;
        self.pending.insert(seq);
        trace!(seq, "sent command");
        Ok(seq)
    }

    // ------------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------------

    /// Advance by `dt`, applying due turns and simulating every whole step.
    /// Returns the number of simulation steps run.
    pub fn update<H: TurnHandler>(
        &mut self,
        dt: Duration,
        handler: &mut H,
    ) -> Result<u32, ClientError> {
        self.diagnostics.elapsed += dt;
        if self.state != ClientState::Running {
            return Ok(0);
        }
        self.clock.advance(dt);

        let steps_per_turn = u64::from(self.config.lockstep.steps_per_turn());
        let step = self.clock.step();
        let mut steps = 0;
        while self.clock.can_step() {
            if self.sim_step % steps_per_turn == 0 {
                let number = self.sim_step / steps_per_turn;
                let turn = match self.turns.get(number) {
                    Ok(Some(turn)) => turn.clone(),
                    Ok(None) => {
                        self.stall(number);
                        break;
                    }
                    Err(err) => return Err(self.fail(err.into())),
                };
                self.resume(number);
                self.apply(&turn, handler)?;
            }
            handler.simulate(step);
            self.clock.commit_step();
            self.sim_step += 1;
            steps += 1;
        }

        self.diagnostics.sample_buffered(self.buffered_turns());
        if self.clock.is_recovering() {
            debug!(pending_steps = self.clock.pending_steps(), "catching up");
        }
        Ok(steps)
    }

    fn apply<H: TurnHandler>(&mut self, turn: &Turn, handler: &mut H) -> Result<(), ClientError> {
        let number = turn.number();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.apply_turn(turn)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(self.fail(err.into())),
            Err(payload) => {
                let message = panic_message(&*payload);
                return Err(self.fail(ResyncReason::ApplyPanicked {
                    turn: number,
                    message,
                }));
            }
        }
        self.next_turn = number + 1;
        trace!(turn = number, commands = turn.commands().len(), "applied turn");

        if let Some(own) = self.client_id {
            for command in turn.commands().iter().filter(|c| c.client_id == own) {
                if self.pending.remove(&command.seq) {
                    self.listeners.emit(&ClientEvent::CommandConfirmed {
                        seq: command.seq,
                        turn: number,
                    });
                }
            }
        }
        self.listeners.emit(&ClientEvent::TurnApplied { number });
        Ok(())
    }

    fn stall(&mut self, turn: TurnNumber) {
        if self.stalled_since.is_some() {
            return;
        }
        debug!(turn, "waiting for turn");
        self.stalled_since = Some(self.diagnostics.elapsed);
        self.diagnostics.stalls += 1;
        self.listeners.emit(&ClientEvent::Stalled { turn });
    }

    fn resume(&mut self, turn: TurnNumber) {
        let Some(since) = self.stalled_since.take() else {
            return;
        };
        let stalled_for = self.diagnostics.elapsed - since;
        self.diagnostics.stalled_time += stalled_for;
        debug!(turn, ?stalled_for, "turn arrived, resuming");
        self.listeners
            .emit(&ClientEvent::Resumed { turn, stalled_for });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================
