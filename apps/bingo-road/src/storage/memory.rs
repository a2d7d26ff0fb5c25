use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use bingo_core::{player_key, session_key, PlayerState, Session};
use tokio::sync::Mutex;

use super::{SessionStore, StoreError, StoreTtls};

struct Entry {
    json: String,
    expires_at: Instant,
}

/// Single-process store for tests and instances running without redis.
/// Values are kept serialized so reads and writes behave like the shared store.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    ttls: StoreTtls,
}

impl MemoryStore {
    pub fn new(ttls: StoreTtls) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttls,
        }
    }

    async fn read<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let mut guard = self.entries.lock().await;
        let expired = match guard.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                return Ok(Some(serde_json::from_str(&entry.json)?));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            guard.remove(key);
        }
        Ok(None)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(StoreTtls::default())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get_session(&self, code: &str) -> Result<Option<Session>, StoreError> {
        self.read(&session_key(code)).await
    }

    async fn put_session(&self, session: &Session) -> Result<(), StoreError> {
        let json = serde_json::to_string(session)?;
        self.entries.lock().await.insert(
            session_key(&session.code),
            Entry {
                json,
                expires_at: Instant::now() + self.ttls.session,
            },
        );
        Ok(())
    }

    async fn put_session_if_version(
        &self,
        session: &Session,
        expected: Option<u64>,
    ) -> Result<bool, StoreError> {
        let key = session_key(&session.code);
        let json = serde_json::to_string(session)?;
        let mut guard = self.entries.lock().await;
        let now = Instant::now();
        let current = match guard.get(&key) {
            Some(entry) if entry.expires_at > now => {
                let stored: Session = serde_json::from_str(&entry.json)?;
                Some(stored.version)
            }
            _ => None,
        };
        if current != expected {
            return Ok(false);
        }
        guard.insert(
            key,
            Entry {
                json,
                expires_at: now + self.ttls.session,
            },
        );
        Ok(true)
    }

    async fn get_player_state(
        &self,
        code: &str,
        player_id: &str,
    ) -> Result<Option<PlayerState>, StoreError> {
        self.read(&player_key(code, player_id)).await
    }

    async fn put_player_state(&self, state: &PlayerState) -> Result<(), StoreError> {
        let json = serde_json::to_string(state)?;
        self.entries.lock().await.insert(
            player_key(&state.code, &state.player_id),
            Entry {
                json,
                expires_at: Instant::now() + self.ttls.player,
            },
        );
        Ok(())
    }
}
