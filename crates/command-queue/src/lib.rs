//! turnsync Command Queue
//!
//! Reliable, ordered delivery of application commands to an HTTP backend,
//! outside the lockstep loop (purchases, profile edits, matchmaking calls).
//!
//! - [`CommandQueue`]: batches commands into packets, retries with
//!   exponential backoff and tracks the backend session. Answered ids and
//!   pushed commands are acknowledged on the next packet, and an optional
//!   auto-sync provider contributes `sync` commands
//! - [`HttpTransport`]: non-blocking request seam, polled from
//!   [`CommandQueue::update`]
//! - `ReqwestTransport` (feature `reqwest-transport`): `reqwest` on a tokio
//!   runtime
//!
//! Every command's completion callback fires exactly once, unless the
//! command is removed or the queue is disposed first.

#![deny(unsafe_code)]

pub mod command;
pub mod config;
pub mod queue;
pub mod transport;

pub use command::{
    Command, CommandError, CommandOutcome, CommandResult, FinishCallback, PackedCommand,
    PacketRequest, PacketResponse, PushCommands, SYNC_COMMAND_NAME, SessionNotice,
};
pub use config::QueueConfig;
pub use queue::{
    AutoSyncProvider, CommandQueue, FlushCallback, QueueError, QueueEvent, QueueSnapshot,
    STATUS_CLOCK_CHANGE, STATUS_SESSION_LOST, Session,
};
#[cfg(feature = "reqwest-transport")]
pub use transport::ReqwestTransport;
pub use transport::{HttpResponse, HttpTransport, PendingResponse, TransportError};
