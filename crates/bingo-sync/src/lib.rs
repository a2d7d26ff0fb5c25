//! Bingo sync: the client half of a shared bingo session.
//!
//! Responsibilities:
//! - talking to the session server over HTTP ([`api`])
//! - holding one live change stream per viewed session ([`manager`]) with a
//!   polling fallback ([`poller`])
//! - merging pushed snapshots into local state without losing optimistic work
//!   ([`reconciler`], [`command`], [`pending`])
//! - the player-facing session handle, including the win-claim flow ([`game`])

pub mod api;
pub mod command;
pub mod game;
pub mod manager;
pub mod pending;
pub mod poller;
pub mod reconciler;

pub use api::{HttpSessionApi, SessionApi, SyncError};
pub use command::{LocalCommand, Tentative};
pub use game::{ClaimOutcome, Delivery, GameSession, MarkOutcome, WinState};
pub use manager::{ConnectionStatus, EventTransport, HttpEventTransport, SyncManager, TransportEvent};
pub use pending::{PendingOp, PendingQueue};
pub use poller::{PollBackoff, PollHandle};
pub use reconciler::{MergeReport, ReconcileError, Reconciler};
