//! Bingo core: the shared vocabulary of the bingo session server and its clients.
//!
//! Responsibilities:
//! - the session document, players, marks and per-player state
//! - presence derivation from heartbeat recency
//! - change notices published on a session channel
//! - the stream frames and sync envelopes pushed to viewers
//! - win-claim requests, responses and near-miss evaluation
//! - request bodies shared by the HTTP routes and the sync client

pub mod claim;
pub mod clock;
pub mod events;
pub mod frame;
pub mod model;
pub mod presence;
pub mod requests;

pub use claim::{ClaimRequest, ClaimResponse, NearMiss, NEAR_MISS_WINDOW_MS};
pub use clock::{Clock, ManualClock, SystemClock};
pub use events::{ChangeKind, ChangeNotice};
pub use frame::{ItemPatch, SessionDelta, SessionSnapshot, StreamFrame, SyncEnvelope};
pub use model::{
    Item, Mark, Player, PlayerState, Session, Settings, ValidationError, WinType, WinnerInfo,
    MAX_PLAYERS,
};
pub use requests::{
    CreateSessionRequest, CreateSessionResponse, HeartbeatRequest, HeartbeatResponse, JoinRequest,
    MarkRequest,
};

/// Storage key for a session document.
pub fn session_key(code: &str) -> String {
    format!("session:{}", code)
}

/// Storage key for one player's local record inside a session.
pub fn player_key(code: &str, player_id: &str) -> String {
    format!("player:{}:{}", code, player_id)
}

/// Pub/sub channel carrying change notices for a session.
pub fn session_channel(code: &str) -> String {
    format!("session:{}", code)
}
