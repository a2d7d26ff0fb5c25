//! Bingo Road: the session server for shared bingo games.
//!
//! Holds each game document in a store keyed by join code, arbitrates the first
//! valid win claim, and pushes every accepted change to viewers over server-sent
//! events.

pub mod arbiter;
pub mod cli;
pub mod codes;
pub mod config;
pub mod metrics;
pub mod notifier;
pub mod routes;
pub mod sessions;
pub mod state;
pub mod storage;
pub mod telemetry;

pub use routes::build_router;
pub use state::AppState;
