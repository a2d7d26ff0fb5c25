use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Shared store and pub/sub. When unset the server keeps everything in memory,
    /// which only works for a single instance.
    pub redis_url: Option<String>,
    pub session_ttl_seconds: u64,
    pub player_ttl_seconds: u64,
    pub stream_keepalive_seconds: u64,
    pub log_filter: String,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env::var("BINGO_ROAD_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            redis_url: env::var("REDIS_URL")
                .ok()
                .map(|url| url.trim().to_string())
                .filter(|url| !url.is_empty()),
            session_ttl_seconds: env::var("SESSION_TTL")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(defaults.session_ttl_seconds),
            player_ttl_seconds: env::var("PLAYER_TTL")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(defaults.player_ttl_seconds),
            stream_keepalive_seconds: env::var("STREAM_KEEPALIVE_SECS")
                .ok()
                .and_then(|t| t.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(defaults.stream_keepalive_seconds),
            log_filter: env::var("BINGO_ROAD_LOG")
                .or_else(|_| env::var("RUST_LOG"))
                .unwrap_or(defaults.log_filter),
        }
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_seconds)
    }

    pub fn player_ttl(&self) -> Duration {
        Duration::from_secs(self.player_ttl_seconds)
    }

    pub fn stream_keepalive(&self) -> Duration {
        Duration::from_secs(self.stream_keepalive_seconds)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            redis_url: None,
            session_ttl_seconds: 2_592_000, // 30 days
            player_ttl_seconds: 604_800,    // 7 days
            stream_keepalive_seconds: 30,
            log_filter: "warn".to_string(),
        }
    }
}
