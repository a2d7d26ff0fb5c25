//! Per-session change fan-out.
//!
//! Each session code with at least one live stream owns a local broadcast topic.
//! With redis configured, publishes go through `PUBLISH session:<code>` so every
//! server instance hears them, and a forwarder task per topic relays the channel
//! into the local broadcast. The topic (and its redis subscription) lives exactly as
//! long as its last [`Subscription`].

use std::sync::Arc;
use std::time::Duration;

use bingo_core::{session_channel, ChangeNotice};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::metrics;

const TOPIC_CAPACITY: usize = 64;
const FORWARDER_RETRY: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct ChangeNotifier {
    inner: Arc<NotifierInner>,
}

struct NotifierInner {
    topics: DashMap<String, Topic>,
    redis: Option<RedisBackplane>,
}

struct RedisBackplane {
    client: redis::Client,
    publisher: ConnectionManager,
}

struct Topic {
    tx: broadcast::Sender<ChangeNotice>,
    subscribers: usize,
    forwarder: Option<JoinHandle<()>>,
}

impl ChangeNotifier {
    /// Notifier for a single instance; notices never leave the process.
    pub fn local() -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                topics: DashMap::new(),
                redis: None,
            }),
        }
    }

    pub async fn with_redis(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            inner: Arc::new(NotifierInner {
                topics: DashMap::new(),
                redis: Some(RedisBackplane { client, publisher }),
            }),
        })
    }

    pub async fn publish(&self, code: &str, notice: ChangeNotice) {
        match &self.inner.redis {
            Some(backplane) => {
                let payload = match serde_json::to_string(&notice) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(session = %code, error = %err, "failed to encode change notice");
                        return;
                    }
                };
                let mut conn = backplane.publisher.clone();
                if let Err(err) = conn
                    .publish::<_, _, ()>(session_channel(code), payload)
                    .await
                {
                    warn!(session = %code, error = %err, "failed to publish change notice");
                }
            }
            None => {
                if let Some(topic) = self.inner.topics.get(code) {
                    let _ = topic.tx.send(notice);
                }
            }
        }
        debug!(session = %code, kind = notice.kind.as_str(), "published change notice");
    }

    pub fn subscribe(&self, code: &str) -> Subscription {
        let rx = {
            let mut topic = self
                .inner
                .topics
                .entry(code.to_string())
                .or_insert_with(|| Topic {
                    tx: broadcast::channel(TOPIC_CAPACITY).0,
                    subscribers: 0,
                    forwarder: None,
                });
            topic.subscribers += 1;
            if topic.forwarder.is_none() {
                if let Some(backplane) = &self.inner.redis {
                    topic.forwarder = Some(spawn_forwarder(
                        backplane.client.clone(),
                        code.to_string(),
                        topic.tx.clone(),
                    ));
                }
            }
            topic.tx.subscribe()
        };
        metrics::stream_subscribed();
        debug!(session = %code, subscribers = self.subscriber_count(code), "stream subscribed");
        Subscription {
            code: code.to_string(),
            rx,
            notifier: self.inner.clone(),
        }
    }

    pub fn subscriber_count(&self, code: &str) -> usize {
        self.inner
            .topics
            .get(code)
            .map(|topic| topic.subscribers)
            .unwrap_or(0)
    }
}

impl NotifierInner {
    fn release(&self, code: &str) {
        if let Entry::Occupied(mut entry) = self.topics.entry(code.to_string()) {
            let topic = entry.get_mut();
            topic.subscribers = topic.subscribers.saturating_sub(1);
            if topic.subscribers == 0 {
                let topic = entry.remove();
                if let Some(forwarder) = topic.forwarder {
                    forwarder.abort();
                }
                debug!(session = %code, "last stream left; channel dropped");
            }
        }
        metrics::stream_unsubscribed();
    }
}

/// One viewer's handle on a session topic. Dropping it is the unsubscribe.
pub struct Subscription {
    code: String,
    rx: broadcast::Receiver<ChangeNotice>,
    notifier: Arc<NotifierInner>,
}

impl Subscription {
    pub fn code(&self) -> &str {
        &self.code
    }

    pub async fn recv(&mut self) -> Result<ChangeNotice, broadcast::error::RecvError> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.notifier.release(&self.code);
    }
}

fn spawn_forwarder(
    client: redis::Client,
    code: String,
    tx: broadcast::Sender<ChangeNotice>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(err) = forward_channel(&client, &code, &tx).await {
                warn!(session = %code, error = %err, "change channel subscription failed; retrying");
            } else {
                debug!(session = %code, "change channel closed; resubscribing");
            }
            tokio::time::sleep(FORWARDER_RETRY).await;
        }
    })
}

async fn forward_channel(
    client: &redis::Client,
    code: &str,
    tx: &broadcast::Sender<ChangeNotice>,
) -> Result<(), redis::RedisError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(session_channel(code)).await?;
    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        let payload: String = msg.get_payload()?;
        match serde_json::from_str::<ChangeNotice>(&payload) {
            Ok(notice) => {
                let _ = tx.send(notice);
            }
            Err(err) => {
                warn!(session = %code, error = %err, "ignoring malformed change notice");
            }
        }
    }
    Ok(())
}
