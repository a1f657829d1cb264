//! The reliable command queue.
//!
//! Commands are batched into packets and sent on a fixed interval (or at
//! once after [`CommandQueue::flush`]). At most one packet is in flight.
//! Retryable failures (transport errors, deadline expiry, 5xx, 408, 429 and
//! unreadable bodies) put the packet's commands back at the front of the
//! queue and back off for `timeout * multiplier^attempt`. A successful
//! response that leaves commands unanswered counts as a failed send for
//! those commands and backs off the same way.
//!
//! Callbacks fire in the order commands were added: a command answered
//! while an earlier one is still outstanding is held until that one
//! finishes.
//!
//! Every packet carries the session watermark it was sent with. Responses
//! to packets from an earlier local session are dropped and their commands
//! resent; a response stamped with an older watermark than the packet is
//! treated as a failed send.

use std::collections::VecDeque;
use std::time::Duration;

#[cfg(test)]
use mock_instant::Instant;
#[cfg(not(test))]
use std::time::Instant;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot::error::TryRecvError;
use tracing::{debug, info, trace, warn};
use turnsync_lockstep::{ConfigError, ListenerId, Listeners};
use uuid::Uuid;

use crate::command::{
    Command, CommandError, CommandResult, FinishCallback, PackedCommand, PacketRequest,
    PacketResponse, SYNC_COMMAND_NAME, unix_timestamp,
};
use crate::config::QueueConfig;
use crate::transport::{HttpResponse, HttpTransport, PendingResponse, TransportError};

/// Status the backend uses when it no longer knows the session.
pub const STATUS_SESSION_LOST: u16 = 482;
/// Status the backend uses when the client clock is too far off.
pub const STATUS_CLOCK_CHANGE: u16 = 472;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueueError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("HTTP status {status}")]
    Http { status: u16 },
    #[error("invalid response body: {0}")]
    InvalidResponse(String),
    #[error("session lost")]
    SessionLost,
    #[error("clock change requested")]
    ClockChange,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// Flipped between reaching the backend and not.
    SyncChanged { synced: bool },
    /// The backend dropped the session. Sending pauses until
    /// [`CommandQueue::set_session`].
    SessionLost,
    /// The backend moved the queue to a new session.
    SessionRotated { session_id: String },
    /// No successful send for longer than `max_out_of_sync_interval_ms`.
    OutOfSync { since: Duration },
    HttpError { status: u16 },
    ClockChange,
    ResponseDiscarded { packet_id: u64, watermark: u64 },
    /// The backend pushed a command. Its id is acknowledged on the next
    /// packet.
    CommandReceived { id: String, payload: Value },
}

/// Called with the outcome of the next packet sent after a flush.
pub type FlushCallback = Box<dyn FnOnce(Result<(), QueueError>)>;

/// Supplies the current sync payload, or `None` when there is nothing to
/// sync.
pub type AutoSyncProvider = Box<dyn FnMut() -> Option<Value>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    /// Bumped on every session change; packets carry it.
    pub watermark: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueSnapshot {
    pub running: bool,
    pub synced: bool,
    pub session: Option<Session>,
    pub pending: usize,
    pub in_flight: usize,
    /// Ids waiting to be acknowledged to the backend.
    pub pending_acks: usize,
    /// Consecutive failed sends.
    pub attempt: u32,
    pub next_packet_id: u64,
    /// Time left before the next retry, while backing off.
    pub retry_in: Option<Duration>,
    /// Time since the backend was last reached, while out of sync.
    pub out_of_sync_for: Option<Duration>,
}

struct InFlight {
    packet_id: u64,
    watermark: u64,
    commands: Vec<PackedCommand>,
    acks: Vec<String>,
    flush_callbacks: Vec<FlushCallback>,
    deadline: Instant,
    response: PendingResponse,
}

pub struct CommandQueue<T: HttpTransport> {
    config: QueueConfig,
    transport: T,
    running: bool,
    disposed: bool,
    session: Option<Session>,
    /// Highest watermark handed out; survives session loss.
    watermark: u64,
    pending: VecDeque<PackedCommand>,
    in_flight: Option<InFlight>,
    pending_acks: Vec<String>,
    next_packet_id: u64,
    flush_requested: bool,
    flush_callbacks: Vec<FlushCallback>,
    next_send_at: Option<Instant>,
    retry_at: Option<Instant>,
    attempt: u32,
    synced: bool,
    sync_changed_at: Instant,
    out_of_sync_reported: bool,
    auto_sync: Option<AutoSyncProvider>,
    auto_sync_enabled: bool,
    last_auto_sync: Option<Value>,
    listeners: Listeners<QueueEvent>,
}

impl<T: HttpTransport> CommandQueue<T> {
    pub fn new(config: QueueConfig, transport: T) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            transport,
            running: false,
            disposed: false,
            session: None,
            watermark: 0,
            pending: VecDeque::new(),
            in_flight: None,
            pending_acks: Vec::new(),
            next_packet_id: 1,
            flush_requested: false,
            flush_callbacks: Vec::new(),
            next_send_at: None,
            retry_at: None,
            attempt: 0,
            synced: true,
            sync_changed_at: Instant::now(),
            out_of_sync_reported: false,
            auto_sync: None,
            auto_sync_enabled: true,
            last_auto_sync: None,
            listeners: Listeners::new(),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Commands not yet reported, in flight included.
    pub fn len(&self) -> usize {
        self.pending.len() + self.in_flight.as_ref().map_or(0, |f| f.commands.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add_listener(&mut self, listener: impl FnMut(&QueueEvent) + 'static) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let now = Instant::now();
        QueueSnapshot {
            running: self.running,
            synced: self.synced,
            session: self.session.clone(),
            pending: self.pending.len(),
            in_flight: self.in_flight.as_ref().map_or(0, |f| f.commands.len()),
            pending_acks: self.pending_acks.len(),
            attempt: self.attempt,
            next_packet_id: self.next_packet_id,
            retry_in: self
                .retry_at
                .map(|at| if at > now { at - now } else { Duration::ZERO }),
            out_of_sync_for: (!self.synced).then(|| now - self.sync_changed_at),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Begin sending. The first regular send happens one interval from now.
    pub fn start(&mut self) {
        if self.disposed || self.running {
            return;
        }
        let now = Instant::now();
        self.running = true;
        self.next_send_at = Some(now + self.config.send_interval());
        self.sync_changed_at = now;
        info!(pending = self.pending.len(), "command queue started");
    }

    /// Stop sending. A packet already in flight is still resolved by
    /// `update`.
    pub fn stop(&mut self) {
        if self.running {
            self.running = false;
            info!("command queue stopped");
        }
    }

    /// Drop all queued and in-flight work without calling back, and restart
    /// packet numbering. The session is kept.
    pub fn reset(&mut self) {
        let dropped = self.len();
        self.pending.clear();
        self.in_flight = None;
        self.pending_acks.clear();
        self.flush_requested = false;
        self.flush_callbacks.clear();
        self.retry_at = None;
        self.attempt = 0;
        self.next_packet_id = 1;
        self.out_of_sync_reported = false;
        self.last_auto_sync = None;
        if dropped > 0 {
            debug!(dropped, "command queue reset");
        }
    }

    /// Stop for good. Nothing queued is sent and no callback fires.
    pub fn dispose(&mut self) {
        self.stop();
        self.reset();
        self.listeners.clear();
        self.auto_sync = None;
        self.disposed = true;
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Adopt a session. The watermark moves on, so responses to packets sent
    /// under any earlier session are discarded.
    pub fn set_session(&mut self, id: impl Into<String>) {
        let id = id.into();
        self.watermark += 1;
        info!(session = %id, watermark = self.watermark, "command queue session set");
        self.session = Some(Session {
            id,
            watermark: self.watermark,
        });
    }

    // ========================================================================
    // Auto-sync
    // ========================================================================

    /// Poll `provider` on every regular send. A payload that differs from
    /// the last one queued becomes a `sync` command.
    pub fn set_auto_sync(&mut self, provider: impl FnMut() -> Option<Value> + 'static) {
        self.auto_sync = Some(Box::new(provider));
        self.last_auto_sync = None;
    }

    pub fn clear_auto_sync(&mut self) {
        self.auto_sync = None;
        self.last_auto_sync = None;
    }

    pub fn set_auto_sync_enabled(&mut self, enabled: bool) {
        self.auto_sync_enabled = enabled;
    }

    pub fn is_auto_sync_enabled(&self) -> bool {
        self.auto_sync_enabled
    }

    fn collect_auto_sync(&mut self) {
        if !self.auto_sync_enabled {
            return;
        }
        let Some(provider) = self.auto_sync.as_mut() else {
            return;
        };
        let Some(data) = provider() else {
            return;
        };
        if self.last_auto_sync.as_ref() != Some(&data) {
            trace!("auto-sync payload changed");
            self.last_auto_sync = Some(data.clone());
            self.pending.push_back(PackedCommand::new(
                Command::new(SYNC_COMMAND_NAME, data),
                None,
            ));
        }
        self.flush_requested = true;
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Queue `command`; `on_finish` fires once it is acknowledged or fails.
    pub fn add(
        &mut self,
        command: Command,
        on_finish: impl FnOnce(&Command, CommandResult) + 'static,
    ) -> Uuid {
        self.enqueue(command, Some(Box::new(on_finish)))
    }

    /// Queue `command` without a completion callback.
    pub fn push(&mut self, command: Command) -> Uuid {
        self.enqueue(command, None)
    }

    fn enqueue(&mut self, command: Command, on_finish: Option<FinishCallback>) -> Uuid {
        let id = command.id;
        if self.disposed {
            warn!(%id, name = %command.name, "command added to a disposed queue is dropped");
            return id;
        }
        trace!(%id, name = %command.name, "command queued");
        self.pending.push_back(PackedCommand::new(command, on_finish));
        id
    }

    /// Send on the next `update` instead of waiting for the interval.
    /// A pending backoff still applies.
    pub fn flush(&mut self) {
        self.flush_requested = true;
    }

    /// Like [`flush`](Self::flush), reporting the outcome of that send.
    pub fn flush_with(&mut self, on_done: impl FnOnce(Result<(), QueueError>) + 'static) {
        self.flush_callbacks.push(Box::new(on_done));
        self.flush_requested = true;
    }

    /// Drop every queued or in-flight command matching `predicate`, without
    /// calling back. Returns how many were dropped.
    pub fn remove(&mut self, mut predicate: impl FnMut(&Command) -> bool) -> usize {
        let before = self.len();
        self.pending.retain(|packed| !predicate(&packed.command));
        if let Some(flight) = self.in_flight.as_mut() {
            flight.commands.retain(|packed| !predicate(&packed.command));
        }
        let removed = before - self.len();
        if self.in_flight.is_none() {
            // Answers held behind a removed command are due now.
            self.release_pending_front();
        }
        if removed > 0 {
            debug!(removed, "commands removed from queue");
        }
        removed
    }

    fn release_pending_front(&mut self) {
        while self.pending.front().is_some_and(PackedCommand::is_answered) {
            if let Some(packed) = self.pending.pop_front() {
                packed.release();
            }
        }
    }

    // ========================================================================
    // Update
    // ========================================================================

    /// Resolve the in-flight packet if its response arrived (or its deadline
    /// passed), then send the next packet if one is due.
    pub fn update(&mut self) {
        if self.disposed {
            return;
        }
        let now = Instant::now();
        self.poll_in_flight(now);
        self.check_out_of_sync(now);

        if !self.running || self.in_flight.is_some() || self.session.is_none() {
            return;
        }

        match self.retry_at {
            Some(at) if now < at => return,
            Some(_) => {
                if !self.has_payload() && !self.config.ping_enabled {
                    // Backoff is over with nothing left to resend.
                    self.retry_at = None;
                    self.next_send_at = Some(now + self.config.send_interval());
                    return;
                }
            }
            None => {
                let interval_due = self.next_send_at.is_none_or(|at| now >= at);
                if interval_due {
                    self.collect_auto_sync();
                }
                if !self.flush_requested && !interval_due {
                    return;
                }
                if !self.has_payload() && !self.flush_requested && !self.config.ping_enabled {
                    self.next_send_at = Some(now + self.config.send_interval());
                    return;
                }
            }
        }
        self.send_packet(now);
    }

    fn has_payload(&self) -> bool {
        !self.pending.is_empty() || !self.flush_callbacks.is_empty() || !self.pending_acks.is_empty()
    }

    fn current_timeout(&self) -> Duration {
        self.config.backoff(self.attempt)
    }

    fn send_packet(&mut self, now: Instant) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let commands: Vec<PackedCommand> = self.pending.drain(..).collect();
        let packet_id = self.next_packet_id;
        self.next_packet_id += 1;

        // Answered commands ride along only to keep their place in line.
        let request = PacketRequest {
            session_id: session.id.clone(),
            watermark: session.watermark,
            packet_id,
            timestamp: unix_timestamp(),
            commands: commands
                .iter()
                .filter(|packed| !packed.is_answered())
                .map(|packed| packed.command.clone())
                .collect(),
            acks: self.pending_acks.clone(),
        };
        let timeout = self.current_timeout();
        debug!(
            packet_id,
            watermark = request.watermark,
            commands = request.commands.len(),
            acks = request.acks.len(),
            attempt = self.attempt,
            "sending command packet"
        );
        let response = self.transport.post(&request, timeout);

        self.in_flight = Some(InFlight {
            packet_id,
            watermark: request.watermark,
            commands,
            acks: request.acks,
            flush_callbacks: std::mem::take(&mut self.flush_callbacks),
            deadline: now + timeout,
            response,
        });
        self.flush_requested = false;
        self.retry_at = None;
        self.next_send_at = Some(now + self.config.send_interval());
    }

    fn poll_in_flight(&mut self, now: Instant) {
        let Some(flight) = self.in_flight.as_mut() else {
            return;
        };
        let outcome = match flight.response.try_recv() {
            Ok(outcome) => outcome,
            Err(TryRecvError::Empty) if now >= flight.deadline => Err(TransportError::Timeout),
            Err(TryRecvError::Empty) => return,
            Err(TryRecvError::Closed) => Err(TransportError::Cancelled),
        };
        let Some(flight) = self.in_flight.take() else {
            return;
        };

        let session_watermark = self.session.as_ref().map(|s| s.watermark);
        if session_watermark != Some(flight.watermark) {
            self.requeue_for_new_session(flight);
            return;
        }

        match outcome {
            Err(err) => self.on_retryable_failure(flight, QueueError::Transport(err), now),
            Ok(response) => self.on_response(flight, response, now),
        }
    }

    fn on_response(&mut self, flight: InFlight, response: HttpResponse, now: Instant) {
        let status = response.status;
        match status {
            200..=299 => match serde_json::from_slice::<PacketResponse>(&response.body) {
                Ok(body) => self.on_success(flight, body, now),
                Err(err) => {
                    self.on_retryable_failure(flight, QueueError::InvalidResponse(err.to_string()), now)
                }
            },
            STATUS_SESSION_LOST => {
                self.set_synced(true, now);
                warn!(packet_id = flight.packet_id, "backend lost the session, pausing");
                self.session = None;
                self.requeue_front(flight.commands);
                finish_flush(flight.flush_callbacks, Err(QueueError::SessionLost));
                self.listeners.emit(&QueueEvent::SessionLost);
            }
            STATUS_CLOCK_CHANGE => {
                self.set_synced(true, now);
                info!(packet_id = flight.packet_id, "backend requested a clock change");
                self.listeners.emit(&QueueEvent::ClockChange);
                self.retry_later(flight, QueueError::ClockChange, now);
            }
            408 | 429 | 500..=599 => {
                self.on_retryable_failure(flight, QueueError::Http { status }, now)
            }
            400..=499 => {
                self.set_synced(true, now);
                self.attempt = 0;
                warn!(packet_id = flight.packet_id, status, "backend rejected packet");
                let mut commands = flight.commands;
                for packed in commands.iter_mut().filter(|p| !p.is_answered()) {
                    packed.set_answer(Err(CommandError::Http { status }));
                }
                self.release_in_order(commands);
                finish_flush(flight.flush_callbacks, Err(QueueError::Http { status }));
                self.listeners.emit(&QueueEvent::HttpError { status });
            }
            _ => self.on_retryable_failure(flight, QueueError::Http { status }, now),
        }
    }

    fn on_success(&mut self, flight: InFlight, mut body: PacketResponse, now: Instant) {
        if let Some(watermark) = body.watermark {
            if watermark < flight.watermark {
                self.on_stale_response(flight, watermark, now);
                return;
            }
        }

        self.set_synced(true, now);
        // The backend has seen these acks.
        self.pending_acks.retain(|id| !flight.acks.contains(id));

        let mut commands = flight.commands;
        let mut answered = 0usize;
        for packed in commands.iter_mut().filter(|p| !p.is_answered()) {
            let id = packed.id().to_string();
            if let Some(outcome) = body.commands.remove(&id) {
                answered += 1;
                packed.set_answer(outcome.into_result());
                self.ack(id);
            }
        }
        let unanswered = commands.iter().filter(|p| !p.is_answered()).count();
        debug!(
            packet_id = flight.packet_id,
            answered,
            unanswered,
            "command packet acknowledged"
        );

        if unanswered == 0 {
            self.attempt = 0;
            self.release_in_order(commands);
        } else {
            let delay = self.config.backoff(self.attempt);
            self.attempt = self.attempt.saturating_add(1);
            warn!(
                packet_id = flight.packet_id,
                unanswered,
                retry_in_ms = delay.as_millis() as u64,
                "backend left commands unanswered"
            );
            self.count_failed_send(&mut commands);
            self.release_in_order(commands);
            self.retry_at = Some(now + delay);
        }
        finish_flush(flight.flush_callbacks, Ok(()));

        for (id, payload) in body.push.commands {
            trace!(%id, "push command received");
            self.ack(id.clone());
            self.listeners.emit(&QueueEvent::CommandReceived { id, payload });
        }

        if let Some(notice) = body.session {
            let current = self.session.as_ref().map(|s| s.id.as_str());
            if current != Some(notice.id.as_str()) {
                self.set_session(notice.id.clone());
                self.listeners.emit(&QueueEvent::SessionRotated {
                    session_id: notice.id,
                });
            }
        }
    }

    fn ack(&mut self, id: String) {
        if !self.pending_acks.contains(&id) {
            self.pending_acks.push(id);
        }
    }

    fn on_retryable_failure(&mut self, flight: InFlight, error: QueueError, now: Instant) {
        self.set_synced(false, now);
        if let QueueError::Http { status } = error {
            self.listeners.emit(&QueueEvent::HttpError { status });
        }
        self.retry_later(flight, error, now);
    }

    /// The backend answered with an older watermark than the packet carried.
    /// Nothing in it is trusted; the send counts as failed and flush
    /// callbacks wait for the next packet.
    fn on_stale_response(&mut self, flight: InFlight, watermark: u64, now: Instant) {
        let delay = self.config.backoff(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        warn!(
            packet_id = flight.packet_id,
            watermark,
            current = flight.watermark,
            retry_in_ms = delay.as_millis() as u64,
            "backend answered with a stale watermark"
        );
        let mut commands = flight.commands;
        self.count_failed_send(&mut commands);
        self.release_in_order(commands);
        self.hold_flush_callbacks(flight.flush_callbacks);
        self.retry_at = Some(now + delay);
        self.listeners.emit(&QueueEvent::ResponseDiscarded {
            packet_id: flight.packet_id,
            watermark,
        });
    }

    /// Count a failed send against the packet's commands and back off.
    fn retry_later(&mut self, flight: InFlight, error: QueueError, now: Instant) {
        let delay = self.config.backoff(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        warn!(
            packet_id = flight.packet_id,
            %error,
            attempt = self.attempt,
            retry_in_ms = delay.as_millis() as u64,
            "command packet failed"
        );
        let mut commands = flight.commands;
        self.count_failed_send(&mut commands);
        self.release_in_order(commands);
        finish_flush(flight.flush_callbacks, Err(error));
        self.retry_at = Some(now + delay);
    }

    fn count_failed_send(&self, commands: &mut [PackedCommand]) {
        let max_retries = self.config.max_retries;
        for packed in commands.iter_mut().filter(|p| !p.is_answered()) {
            packed.retries += 1;
            if packed.retries > max_retries {
                warn!(id = %packed.id(), retries = max_retries, "command dropped after retries");
                packed.set_answer(Err(CommandError::RetriesExhausted {
                    retries: max_retries,
                }));
            }
        }
    }

    /// Report answered commands up to the first unanswered one; that one and
    /// everything after it go back to the front of the queue.
    fn release_in_order(&mut self, commands: Vec<PackedCommand>) {
        let mut blocked = false;
        let mut requeue = Vec::new();
        for packed in commands {
            if !blocked && packed.is_answered() {
                packed.release();
            } else {
                blocked = true;
                requeue.push(packed);
            }
        }
        self.requeue_front(requeue);
    }

    /// Drop a response to a packet sent under an earlier local session. Its
    /// commands and flush callbacks go back to the queue untouched.
    fn requeue_for_new_session(&mut self, flight: InFlight) {
        warn!(
            packet_id = flight.packet_id,
            watermark = flight.watermark,
            current = ?self.session.as_ref().map(|s| s.watermark),
            "discarding response from an earlier session"
        );
        self.requeue_front(flight.commands);
        self.hold_flush_callbacks(flight.flush_callbacks);
        self.flush_requested = true;
        self.listeners.emit(&QueueEvent::ResponseDiscarded {
            packet_id: flight.packet_id,
            watermark: flight.watermark,
        });
    }

    /// Put a packet's flush callbacks ahead of any registered since.
    fn hold_flush_callbacks(&mut self, mut callbacks: Vec<FlushCallback>) {
        if !callbacks.is_empty() {
            callbacks.append(&mut self.flush_callbacks);
            self.flush_callbacks = callbacks;
        }
    }

    fn requeue_front(&mut self, commands: Vec<PackedCommand>) {
        for packed in commands.into_iter().rev() {
            self.pending.push_front(packed);
        }
    }

    fn set_synced(&mut self, synced: bool, now: Instant) {
        if self.synced == synced {
            return;
        }
        self.synced = synced;
        self.sync_changed_at = now;
        self.out_of_sync_reported = false;
        info!(synced, "command queue sync changed");
        self.listeners.emit(&QueueEvent::SyncChanged { synced });
    }

    fn check_out_of_sync(&mut self, now: Instant) {
        let Some(limit) = self.config.max_out_of_sync_interval() else {
            return;
        };
        if self.synced || self.out_of_sync_reported {
            return;
        }
        let since = now - self.sync_changed_at;
        if since >= limit {
            self.out_of_sync_reported = true;
            warn!(since_ms = since.as_millis() as u64, "command queue out of sync");
            self.listeners.emit(&QueueEvent::OutOfSync { since });
        }
    }
}

fn finish_flush(callbacks: Vec<FlushCallback>, result: Result<(), QueueError>) {
    for callback in callbacks {
        callback(result.clone());
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mock_instant::MockClock;
    use serde_json::{Value, json};
    use std::cell::RefCell;
    use std::rc::Rc;
    use test_log::test;
    use tokio::sync::oneshot;

    type Responder = oneshot::Sender<Result<HttpResponse, TransportError>>;

    /// Records every request; tests answer them in order.
    #[derive(Default)]
    struct MockTransport {
        sent: Vec<(Instant, PacketRequest)>,
        waiting: VecDeque<Responder>,
        /// Answer every request at once with a connection error.
        fail_all: bool,
    }

    impl MockTransport {
        fn respond(&mut self, status: u16, body: Value) {
            let responder = self.waiting.pop_front().expect("no request waiting");
            let bytes = serde_json::to_vec(&body).unwrap();
            let _ = responder.send(Ok(HttpResponse::new(status, bytes)));
        }

        fn respond_raw(&mut self, status: u16, body: &[u8]) {
            let responder = self.waiting.pop_front().expect("no request waiting");
            let _ = responder.send(Ok(HttpResponse::new(status, body.to_vec())));
        }

        /// Acknowledge every command of the latest request.
        fn ack_all(&mut self) {
            let (_, request) = self.sent.last().expect("nothing sent").clone();
            let commands: serde_json::Map<String, Value> = request
                .commands
                .iter()
                .map(|c| (c.id.to_string(), json!({"response": c.name})))
                .collect();
            self.respond(200, json!({"watermark": request.watermark, "commands": commands}));
        }

        fn last(&self) -> &PacketRequest {
            &self.sent.last().expect("nothing sent").1
        }
    }

    impl HttpTransport for MockTransport {
        fn post(&mut self, request: &PacketRequest, _timeout: Duration) -> PendingResponse {
            let (tx, rx) = oneshot::channel();
            self.sent.push((Instant::now(), request.clone()));
            if self.fail_all {
                let _ = tx.send(Err(TransportError::Connection("refused".to_string())));
            } else {
                self.waiting.push_back(tx);
            }
            rx
        }
    }

    type Finished = Rc<RefCell<Vec<(String, CommandResult)>>>;

    fn config() -> QueueConfig {
        QueueConfig {
            send_interval_ms: 1000,
            timeout_ms: 1000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 60_000,
            ping_enabled: false,
            ..Default::default()
        }
    }

    fn queue(config: QueueConfig) -> CommandQueue<MockTransport> {
        let mut queue = CommandQueue::new(config, MockTransport::default()).unwrap();
        queue.set_session("s1");
        queue.start();
        queue
    }

    fn add(queue: &mut CommandQueue<MockTransport>, name: &str, finished: &Finished) -> Uuid {
        let finished = Rc::clone(finished);
        queue.add(Command::new(name, Value::Null), move |command, result| {
            finished.borrow_mut().push((command.name.clone(), result));
        })
    }

    fn events(queue: &mut CommandQueue<MockTransport>) -> Rc<RefCell<Vec<QueueEvent>>> {
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);
        queue.add_listener(move |e| sink.borrow_mut().push(e.clone()));
        events
    }

    fn names(request: &PacketRequest) -> Vec<&str> {
        request.commands.iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn test_commands_batched_within_interval() {
        let mut queue = queue(config());
        let finished = Finished::default();
        for name in ["a", "b", "c"] {
            add(&mut queue, name, &finished);
        }

        queue.update();
        MockClock::advance(Duration::from_millis(999));
        queue.update();
        assert!(queue.transport().sent.is_empty());

        MockClock::advance(Duration::from_millis(1));
        queue.update();
        assert_eq!(queue.transport().sent.len(), 1);
        let request = queue.transport().last().clone();
        assert_eq!(names(&request), vec!["a", "b", "c"]);
        assert_eq!(request.session_id, "s1");
        assert_eq!(request.watermark, 1);
        assert_eq!(request.packet_id, 1);
        assert_eq!(queue.snapshot().in_flight, 3);

        queue.transport_mut().ack_all();
        queue.update();
        let finished = finished.borrow();
        let order: Vec<_> = finished.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(finished[0].1, Ok(Some(json!("a"))));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_single_in_flight_packet() {
        let mut queue = queue(config());
        let finished = Finished::default();
        add(&mut queue, "first", &finished);
        queue.flush();
        queue.update();

        add(&mut queue, "second", &finished);
        queue.flush();
        MockClock::advance(Duration::from_millis(500));
        queue.update();
        assert_eq!(queue.transport().sent.len(), 1);
        assert_eq!(queue.len(), 2);

        queue.transport_mut().ack_all();
        queue.update();
        queue.update();
        assert_eq!(queue.transport().sent.len(), 2);
        assert_eq!(names(queue.transport().last()), vec!["second"]);
        assert_eq!(queue.transport().last().packet_id, 2);
    }

    #[test]
    fn test_backoff_schedule() {
        let mut queue = queue(config());
        queue.transport_mut().fail_all = true;
        let finished = Finished::default();
        add(&mut queue, "a", &finished);
        queue.flush();

        // Each failure is resolved by the update after the send.
        queue.update();
        queue.update();
        MockClock::advance(Duration::from_millis(999));
        queue.update();
        assert_eq!(queue.transport().sent.len(), 1);

        MockClock::advance(Duration::from_millis(1));
        queue.update();
        queue.update();
        MockClock::advance(Duration::from_secs(2));
        queue.update();
        queue.update();
        MockClock::advance(Duration::from_secs(4));
        queue.update();

        let times: Vec<_> = queue.transport().sent.iter().map(|(at, _)| *at).collect();
        assert_eq!(times.len(), 4);
        let gaps: Vec<_> = times.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps, [1, 2, 4].map(Duration::from_secs).to_vec());
        assert!(finished.borrow().is_empty());
        assert_eq!(queue.snapshot().attempt, 3);
    }

    #[test]
    fn test_failure_then_success_calls_back_once() {
        let mut queue = queue(config());
        let events = events(&mut queue);
        let finished = Finished::default();
        add(&mut queue, "a", &finished);
        queue.flush();
        queue.update();

        queue.transport_mut().respond(503, json!({}));
        queue.update();
        assert!(!queue.is_synced());
        assert_eq!(queue.snapshot().pending, 1);
        assert_eq!(queue.snapshot().retry_in, Some(Duration::from_secs(1)));
        assert_eq!(queue.snapshot().out_of_sync_for, Some(Duration::ZERO));

        MockClock::advance(Duration::from_secs(1));
        queue.update();
        assert_eq!(queue.transport().sent.len(), 2);
        queue.transport_mut().ack_all();
        queue.update();

        assert_eq!(finished.borrow().len(), 1);
        assert!(finished.borrow()[0].1.is_ok());
        assert!(queue.is_synced());
        assert_eq!(queue.snapshot().attempt, 0);
        assert_eq!(
            *events.borrow(),
            vec![
                QueueEvent::SyncChanged { synced: false },
                QueueEvent::HttpError { status: 503 },
                QueueEvent::SyncChanged { synced: true },
            ]
        );
    }

    #[test]
    fn test_retries_exhausted() {
        let mut queue = queue(QueueConfig {
            max_retries: 2,
            ..config()
        });
        queue.transport_mut().fail_all = true;
        let finished = Finished::default();
        add(&mut queue, "a", &finished);
        queue.flush();

        for _ in 0..3 {
            queue.update();
            queue.update();
            MockClock::advance(Duration::from_secs(10));
        }
        assert_eq!(queue.transport().sent.len(), 3);
        assert_eq!(
            finished.borrow()[0].1,
            Err(CommandError::RetriesExhausted { retries: 2 })
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_stale_session_response_discarded() {
        let mut queue = queue(config());
        let events = events(&mut queue);
        let finished = Finished::default();
        add(&mut queue, "a", &finished);
        queue.flush();
        queue.update();

        queue.set_session("s2");
        queue.transport_mut().ack_all();
        queue.update();
        assert!(finished.borrow().is_empty());
        assert_eq!(
            events.borrow()[0],
            QueueEvent::ResponseDiscarded {
                packet_id: 1,
                watermark: 1
            }
        );

        // Resent under the new session.
        queue.update();
        let request = queue.transport().last().clone();
        assert_eq!(request.session_id, "s2");
        assert_eq!(request.watermark, 2);
        assert_eq!(names(&request), vec!["a"]);

        queue.transport_mut().ack_all();
        queue.update();
        assert_eq!(finished.borrow().len(), 1);
    }

    #[test]
    fn test_older_response_watermark_backs_off() {
        let mut queue = queue(config());
        let events = events(&mut queue);
        let finished = Finished::default();
        add(&mut queue, "a", &finished);
        let outcome = Rc::new(RefCell::new(None));
        let seen = Rc::clone(&outcome);
        queue.flush_with(move |result| *seen.borrow_mut() = Some(result));
        queue.update();

        let id = queue.transport().last().commands[0].id.to_string();
        for _ in 0..3 {
            queue
                .transport_mut()
                .respond(200, json!({"watermark": 0, "commands": {id.clone(): {"response": 1}}}));
            queue.update();
            queue.update();
            assert!(finished.borrow().is_empty());
            assert!(queue.snapshot().retry_in > Some(Duration::ZERO));
            MockClock::advance(Duration::from_secs(10));
            queue.update();
        }

        assert_eq!(queue.transport().sent.len(), 4);
        assert_eq!(queue.snapshot().attempt, 3);
        assert!(queue.is_synced());
        assert!(outcome.borrow().is_none());

        queue.transport_mut().ack_all();
        queue.update();
        assert_eq!(*outcome.borrow(), Some(Ok(())));
        assert_eq!(
            *finished.borrow(),
            vec![("a".to_string(), Ok(Some(json!("a"))))]
        );
        assert_eq!(
            events.borrow()[0],
            QueueEvent::ResponseDiscarded {
                packet_id: 1,
                watermark: 0
            }
        );
    }

    #[test]
    fn test_unanswered_commands_retried_after_backoff() {
        let mut queue = queue(config());
        let finished = Finished::default();
        let a = add(&mut queue, "a", &finished);
        add(&mut queue, "b", &finished);
        queue.flush();
        queue.update();

        queue.transport_mut().respond(
            200,
            json!({"commands": {a.to_string(): {"error": {"code": "NO_GOLD"}}}}),
        );
        queue.update();
        assert_eq!(
            finished.borrow()[0],
            (
                "a".to_string(),
                Err(CommandError::Rejected(json!({"code": "NO_GOLD"})))
            )
        );
        assert_eq!(queue.snapshot().retry_in, Some(Duration::from_secs(1)));

        queue.update();
        assert_eq!(queue.transport().sent.len(), 1);

        MockClock::advance(Duration::from_secs(1));
        queue.update();
        assert_eq!(queue.transport().sent.len(), 2);
        assert_eq!(names(queue.transport().last()), vec!["b"]);
    }

    #[test]
    fn test_never_answered_command_exhausts_retries() {
        let mut queue = queue(QueueConfig {
            max_retries: 2,
            ..config()
        });
        let finished = Finished::default();
        add(&mut queue, "a", &finished);
        queue.flush();
        queue.update();

        for round in 1..=3 {
            queue.transport_mut().respond(200, json!({"commands": {}}));
            queue.update();
            queue.update();
            assert_eq!(queue.transport().sent.len(), round);
            MockClock::advance(Duration::from_secs(10));
            queue.update();
        }

        assert_eq!(queue.transport().sent.len(), 3);
        assert_eq!(
            *finished.borrow(),
            vec![(
                "a".to_string(),
                Err(CommandError::RetriesExhausted { retries: 2 })
            )]
        );
        assert!(queue.is_empty());
        assert!(queue.is_synced());
    }

    #[test]
    fn test_later_answer_held_until_earlier_finishes() {
        let mut queue = queue(config());
        let finished = Finished::default();
        let a = add(&mut queue, "a", &finished);
        let b = add(&mut queue, "b", &finished);
        queue.flush();
        queue.update();

        queue
            .transport_mut()
            .respond(200, json!({"commands": {b.to_string(): {"response": 2}}}));
        queue.update();
        assert!(finished.borrow().is_empty());
        assert_eq!(queue.len(), 2);

        MockClock::advance(Duration::from_secs(1));
        queue.update();
        assert_eq!(names(queue.transport().last()), vec!["a"]);
        assert_eq!(queue.transport().last().acks, vec![b.to_string()]);

        queue
            .transport_mut()
            .respond(200, json!({"commands": {a.to_string(): {"response": 1}}}));
        queue.update();
        assert_eq!(
            *finished.borrow(),
            vec![
                ("a".to_string(), Ok(Some(json!(1)))),
                ("b".to_string(), Ok(Some(json!(2)))),
            ]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_removing_blocker_releases_held_answers() {
        let mut queue = queue(config());
        let finished = Finished::default();
        add(&mut queue, "a", &finished);
        let b = add(&mut queue, "b", &finished);
        queue.flush();
        queue.update();
        queue
            .transport_mut()
            .respond(200, json!({"commands": {b.to_string(): {}}}));
        queue.update();
        assert!(finished.borrow().is_empty());

        assert_eq!(queue.remove(|c| c.name == "a"), 1);
        assert_eq!(*finished.borrow(), vec![("b".to_string(), Ok(None))]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_idle_after_backoff_waits_for_interval() {
        let mut queue = queue(config());
        let finished = Finished::default();
        add(&mut queue, "a", &finished);
        queue.flush();
        queue.update();
        queue.transport_mut().respond(503, json!({}));
        queue.update();
        queue.remove(|_| true);

        MockClock::advance(Duration::from_secs(1));
        queue.update();
        assert_eq!(queue.snapshot().retry_in, None);

        add(&mut queue, "b", &finished);
        queue.update();
        MockClock::advance(Duration::from_millis(999));
        queue.update();
        assert_eq!(queue.transport().sent.len(), 1);

        MockClock::advance(Duration::from_millis(1));
        queue.update();
        assert_eq!(queue.transport().sent.len(), 2);
        assert_eq!(names(queue.transport().last()), vec!["b"]);
    }

    #[test]
    fn test_acks_sent_until_delivered() {
        let mut queue = queue(config());
        let finished = Finished::default();
        let a = add(&mut queue, "a", &finished);
        queue.flush();
        queue.update();
        assert!(queue.transport().last().acks.is_empty());
        queue.transport_mut().ack_all();
        queue.update();
        assert_eq!(queue.snapshot().pending_acks, 1);

        // A failed send keeps them.
        MockClock::advance(Duration::from_secs(1));
        queue.update();
        assert_eq!(queue.transport().last().acks, vec![a.to_string()]);
        queue.transport_mut().respond(503, json!({}));
        queue.update();
        MockClock::advance(Duration::from_secs(1));
        queue.update();
        assert_eq!(queue.transport().sent.len(), 3);
        assert_eq!(queue.transport().last().acks, vec![a.to_string()]);

        queue.transport_mut().respond(200, json!({}));
        queue.update();
        assert_eq!(queue.snapshot().pending_acks, 0);
        MockClock::advance(Duration::from_secs(5));
        queue.update();
        assert_eq!(queue.transport().sent.len(), 3);
    }

    #[test]
    fn test_push_commands_dispatched_and_acked() {
        let mut queue = queue(config());
        let events = events(&mut queue);
        queue.flush();
        queue.update();
        queue.transport_mut().respond(
            200,
            json!({"push": {"commands": {"p2": {"name": "gift"}, "p1": {"name": "mail"}}}}),
        );
        queue.update();

        assert_eq!(
            *events.borrow(),
            vec![
                QueueEvent::CommandReceived {
                    id: "p1".to_string(),
                    payload: json!({"name": "mail"})
                },
                QueueEvent::CommandReceived {
                    id: "p2".to_string(),
                    payload: json!({"name": "gift"})
                },
            ]
        );
        MockClock::advance(Duration::from_secs(1));
        queue.update();
        assert_eq!(queue.transport().last().acks, vec!["p1", "p2"]);
    }

    #[test]
    fn test_auto_sync_queues_changed_payloads() {
        let mut queue = queue(config());
        let state = Rc::new(RefCell::new(Some(json!({"gold": 5}))));
        let source = Rc::clone(&state);
        queue.set_auto_sync(move || source.borrow().clone());

        MockClock::advance(Duration::from_secs(1));
        queue.update();
        let request = queue.transport().last().clone();
        assert_eq!(names(&request), vec![SYNC_COMMAND_NAME]);
        assert_eq!(request.commands[0].args, json!({"gold": 5}));
        queue.transport_mut().ack_all();

        // Unchanged payload: only the ack goes out.
        MockClock::advance(Duration::from_secs(1));
        queue.update();
        assert_eq!(queue.transport().sent.len(), 2);
        assert!(queue.transport().last().commands.is_empty());
        queue.transport_mut().respond(200, json!({}));

        *state.borrow_mut() = Some(json!({"gold": 7}));
        MockClock::advance(Duration::from_secs(1));
        queue.update();
        assert_eq!(queue.transport().sent.len(), 3);
        assert_eq!(queue.transport().last().commands[0].args, json!({"gold": 7}));
        queue.transport_mut().ack_all();
        queue.update();

        queue.set_auto_sync_enabled(false);
        *state.borrow_mut() = Some(json!({"gold": 9}));
        MockClock::advance(Duration::from_secs(1));
        queue.update();
        assert_eq!(queue.transport().sent.len(), 4);
        assert!(queue.transport().last().commands.is_empty());
    }

    #[test]
    fn test_remove_pending_and_in_flight() {
        let mut queue = queue(config());
        let finished = Finished::default();
        add(&mut queue, "keep", &finished);
        add(&mut queue, "drop", &finished);
        queue.flush();
        queue.update();
        add(&mut queue, "drop", &finished);

        assert_eq!(queue.remove(|c| c.name == "drop"), 2);
        assert_eq!(queue.remove(|c| c.name == "drop"), 0);

        queue.transport_mut().ack_all();
        queue.update();
        let finished = finished.borrow();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].0, "keep");
    }

    #[test]
    fn test_dispose_drops_without_callbacks() {
        let mut queue = queue(config());
        let events = events(&mut queue);
        let finished = Finished::default();
        add(&mut queue, "a", &finished);
        queue.flush();
        queue.update();
        add(&mut queue, "b", &finished);

        queue.dispose();
        assert!(queue.is_disposed());
        assert!(queue.is_empty());

        queue.transport_mut().ack_all();
        add(&mut queue, "c", &finished);
        MockClock::advance(Duration::from_secs(5));
        queue.update();
        assert!(finished.borrow().is_empty());
        assert!(events.borrow().is_empty());
        assert_eq!(queue.transport().sent.len(), 1);
    }

    #[test]
    fn test_session_lost_pauses_until_new_session() {
        let mut queue = queue(config());
        let events = events(&mut queue);
        let finished = Finished::default();
        add(&mut queue, "a", &finished);
        queue.flush();
        queue.update();

        queue.transport_mut().respond(STATUS_SESSION_LOST, json!({}));
        queue.update();
        assert_eq!(*events.borrow(), vec![QueueEvent::SessionLost]);
        assert!(queue.session().is_none());

        MockClock::advance(Duration::from_secs(5));
        queue.flush();
        queue.update();
        assert_eq!(queue.transport().sent.len(), 1);

        queue.set_session("s2");
        queue.update();
        assert_eq!(queue.transport().sent.len(), 2);
        assert_eq!(queue.transport().last().watermark, 2);
        assert!(finished.borrow().is_empty());
    }

    #[test]
    fn test_clock_change_resends() {
        let mut queue = queue(config());
        let events = events(&mut queue);
        let finished = Finished::default();
        add(&mut queue, "a", &finished);
        queue.flush();
        queue.update();

        queue.transport_mut().respond(STATUS_CLOCK_CHANGE, json!({}));
        queue.update();
        assert_eq!(*events.borrow(), vec![QueueEvent::ClockChange]);
        queue.update();
        assert_eq!(queue.transport().sent.len(), 1);
        MockClock::advance(Duration::from_secs(1));
        queue.update();
        assert_eq!(queue.transport().sent.len(), 2);
        assert!(finished.borrow().is_empty());
    }

    #[test]
    fn test_client_error_fails_batch() {
        let mut queue = queue(config());
        let finished = Finished::default();
        add(&mut queue, "a", &finished);
        add(&mut queue, "b", &finished);
        let outcome = Rc::new(RefCell::new(None));
        let seen = Rc::clone(&outcome);
        queue.flush_with(move |result| *seen.borrow_mut() = Some(result));
        queue.update();

        queue.transport_mut().respond(400, json!({}));
        queue.update();
        let finished = finished.borrow();
        assert_eq!(finished.len(), 2);
        assert!(
            finished
                .iter()
                .all(|(_, result)| *result == Err(CommandError::Http { status: 400 }))
        );
        assert_eq!(
            *outcome.borrow(),
            Some(Err(QueueError::Http { status: 400 }))
        );
        assert!(queue.is_synced());
    }

    #[test]
    fn test_invalid_body_is_retried() {
        let mut queue = queue(config());
        let finished = Finished::default();
        add(&mut queue, "a", &finished);
        queue.flush();
        queue.update();

        queue.transport_mut().respond_raw(200, b"<html>");
        queue.update();
        assert!(finished.borrow().is_empty());
        assert!(!queue.is_synced());
        assert_eq!(queue.snapshot().pending, 1);
    }

    #[test]
    fn test_deadline_expiry_is_retried() {
        let mut queue = queue(config());
        let finished = Finished::default();
        add(&mut queue, "a", &finished);
        queue.flush();
        queue.update();

        MockClock::advance(Duration::from_millis(999));
        queue.update();
        assert_eq!(queue.snapshot().in_flight, 1);

        MockClock::advance(Duration::from_millis(1));
        queue.update();
        assert_eq!(queue.snapshot().pending, 1);
        assert_eq!(queue.snapshot().attempt, 1);

        // Late answer to the abandoned request goes nowhere.
        queue.transport_mut().ack_all();
        MockClock::advance(Duration::from_secs(1));
        queue.update();
        assert_eq!(queue.transport().sent.len(), 2);
        assert!(finished.borrow().is_empty());
    }

    #[test]
    fn test_ping_when_idle() {
        let mut queue = queue(QueueConfig {
            ping_enabled: true,
            ..config()
        });
        MockClock::advance(Duration::from_secs(1));
        queue.update();
        assert_eq!(queue.transport().sent.len(), 1);
        assert!(queue.transport().last().commands.is_empty());

        let mut quiet = self::queue(config());
        MockClock::advance(Duration::from_secs(3));
        quiet.update();
        assert!(quiet.transport().sent.is_empty());
    }

    #[test]
    fn test_session_rotated_by_backend() {
        let mut queue = queue(config());
        let events = events(&mut queue);
        queue.flush();
        queue.update();
        queue
            .transport_mut()
            .respond(200, json!({"session": {"id": "s9"}}));
        queue.update();

        assert_eq!(
            *events.borrow(),
            vec![QueueEvent::SessionRotated {
                session_id: "s9".to_string()
            }]
        );
        assert_eq!(
            queue.session(),
            Some(&Session {
                id: "s9".to_string(),
                watermark: 2
            })
        );
    }

    #[test]
    fn test_out_of_sync_reported_once() {
        let mut queue = queue(QueueConfig {
            max_out_of_sync_interval_ms: 5000,
            ..config()
        });
        let events = events(&mut queue);
        queue.transport_mut().fail_all = true;
        add(&mut queue, "a", &Finished::default());
        queue.flush();
        queue.update();
        queue.update();

        MockClock::advance(Duration::from_secs(4));
        queue.update();
        assert!(!events.borrow().iter().any(|e| matches!(e, QueueEvent::OutOfSync { .. })));

        MockClock::advance(Duration::from_secs(1));
        queue.update();
        MockClock::advance(Duration::from_secs(10));
        queue.update();
        let reports: Vec<_> = events
            .borrow()
            .iter()
            .filter(|e| matches!(e, QueueEvent::OutOfSync { .. }))
            .cloned()
            .collect();
        assert_eq!(
            reports,
            vec![QueueEvent::OutOfSync {
                since: Duration::from_secs(5)
            }]
        );
    }

    #[test]
    fn test_stopped_queue_does_not_send() {
        let mut queue = queue(config());
        queue.stop();
        add(&mut queue, "a", &Finished::default());
        queue.flush();
        queue.update();
        assert!(queue.transport().sent.is_empty());

        queue.start();
        queue.update();
        assert_eq!(queue.transport().sent.len(), 1);
    }

    #[test]
    fn test_reset_restarts_packet_ids() {
        let mut queue = queue(config());
        let finished = Finished::default();
        add(&mut queue, "a", &finished);
        queue.flush();
        queue.update();
        queue.reset();
        assert!(queue.is_empty());

        add(&mut queue, "b", &finished);
        queue.flush();
        queue.update();
        assert_eq!(queue.transport().last().packet_id, 1);
        assert!(finished.borrow().is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = QueueConfig {
            timeout_ms: 0,
            ..Default::default()
        };
        assert!(CommandQueue::new(config, MockTransport::default()).is_err());
    }
}
