//! Authoritative per-session document store.
//!
//! Documents are whole-value key/value entries with a TTL; the store never merges.
//! Concurrent writers are kept from clobbering each other by
//! [`SessionStore::put_session_if_version`], which only lands a write when the
//! stored `version` is the one the writer read.

mod memory;
mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bingo_core::{PlayerState, Session};
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct StoreTtls {
    pub session: Duration,
    pub player: Duration,
}

impl Default for StoreTtls {
    fn default() -> Self {
        Self {
            session: Duration::from_secs(2_592_000),
            player: Duration::from_secs(604_800),
        }
    }
}

pub type StoreHandle = Arc<dyn SessionStore>;

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_session(&self, code: &str) -> Result<Option<Session>, StoreError>;

    /// Unconditional overwrite, refreshing the TTL.
    async fn put_session(&self, session: &Session) -> Result<(), StoreError>;

    /// Writes `session` only if the stored document's `version` equals `expected`.
    /// `None` means the key must not exist yet. Returns `false` when the guard failed.
    async fn put_session_if_version(
        &self,
        session: &Session,
        expected: Option<u64>,
    ) -> Result<bool, StoreError>;

    async fn get_player_state(
        &self,
        code: &str,
        player_id: &str,
    ) -> Result<Option<PlayerState>, StoreError>;

    async fn put_player_state(&self, state: &PlayerState) -> Result<(), StoreError>;
}

pub async fn build_store(redis_url: Option<&str>, ttls: StoreTtls) -> Result<StoreHandle, StoreError> {
    match redis_url {
        Some(url) => Ok(Arc::new(RedisStore::connect(url, ttls).await?)),
        None => Ok(Arc::new(MemoryStore::new(ttls))),
    }
}
