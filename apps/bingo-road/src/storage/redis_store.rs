use async_trait::async_trait;
use bingo_core::{player_key, session_key, PlayerState, Session};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};

use super::{SessionStore, StoreError, StoreTtls};

/// Compare-and-set on the `version` field of a JSON document.
/// ARGV[1] is the expected version ("" for "must not exist"), ARGV[2] the new
/// document, ARGV[3] the TTL in seconds.
const PUT_IF_VERSION: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '' then
  if current then return 0 end
else
  if not current then return 0 end
  local stored = cjson.decode(current)['version'] or 0
  if tostring(stored) ~= ARGV[1] then return 0 end
end
redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
return 1
"#;

#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
    ttls: StoreTtls,
    put_if_version: Script,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, ttls: StoreTtls) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self {
            redis,
            ttls,
            put_if_version: Script::new(PUT_IF_VERSION),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(key).await?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SessionStore for RedisStore {
    async fn get_session(&self, code: &str) -> Result<Option<Session>, StoreError> {
        self.get_json(&session_key(code)).await
    }

    async fn put_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let value = serde_json::to_string(session)?;
        conn.set_ex::<_, _, ()>(session_key(&session.code), value, self.ttls.session.as_secs())
            .await?;
        Ok(())
    }

    async fn put_session_if_version(
        &self,
        session: &Session,
        expected: Option<u64>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let value = serde_json::to_string(session)?;
        let expected = expected.map(|v| v.to_string()).unwrap_or_default();
        let applied: i64 = self
            .put_if_version
            .key(session_key(&session.code))
            .arg(expected)
            .arg(value)
            .arg(self.ttls.session.as_secs())
            .invoke_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn get_player_state(
        &self,
        code: &str,
        player_id: &str,
    ) -> Result<Option<PlayerState>, StoreError> {
        self.get_json(&player_key(code, player_id)).await
    }

    async fn put_player_state(&self, state: &PlayerState) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let value = serde_json::to_string(state)?;
        conn.set_ex::<_, _, ()>(
            player_key(&state.code, &state.player_id),
            value,
            self.ttls.player.as_secs(),
        )
        .await?;
        Ok(())
    }
}
