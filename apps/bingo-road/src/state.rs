use std::sync::Arc;
use std::time::Duration;

use bingo_core::{Clock, SystemClock};
use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::Config;
use crate::notifier::ChangeNotifier;
use crate::sessions::SessionService;
use crate::storage::{build_store, MemoryStore, StoreError, StoreTtls};

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionService,
    pub stream_keepalive: Duration,
    prometheus: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(sessions: SessionService, stream_keepalive: Duration) -> Self {
        Self {
            sessions,
            stream_keepalive,
            prometheus: None,
        }
    }

    /// Single-instance state backed by memory; what tests and `REDIS_URL`-less runs use.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        let sessions = SessionService::new(
            Arc::new(MemoryStore::default()),
            ChangeNotifier::local(),
            clock,
        );
        Self::new(sessions, Config::default().stream_keepalive())
    }

    pub async fn from_config(config: &Config) -> Result<Self, StoreError> {
        let ttls = StoreTtls {
            session: config.session_ttl(),
            player: config.player_ttl(),
        };
        let store = build_store(config.redis_url.as_deref(), ttls).await?;
        let notifier = match &config.redis_url {
            Some(url) => ChangeNotifier::with_redis(url).await?,
            None => ChangeNotifier::local(),
        };
        let sessions = SessionService::new(store, notifier, Arc::new(SystemClock));
        Ok(Self::new(sessions, config.stream_keepalive()))
    }

    pub fn with_prometheus(mut self, handle: Option<PrometheusHandle>) -> Self {
        self.prometheus = handle;
        self
    }

    pub fn render_metrics(&self) -> Option<String> {
        self.prometheus.as_ref().map(PrometheusHandle::render)
    }
}
