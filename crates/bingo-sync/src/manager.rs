//! One live change stream per viewed session.
//!
//! [`SyncManager::connect`] tears down whatever stream it was running and starts a
//! new one on a spawned task. Frames are handed out on an mpsc channel; connectivity
//! is published on a watch channel. The HTTP transport leans on
//! `reqwest-eventsource`'s own retry for dropped connections, and the manager only
//! reopens the stream itself when the transport gives up.

use std::sync::Arc;
use std::time::Duration;

use bingo_core::{StreamFrame, SyncEnvelope};
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::SyncError;

const REOPEN_DELAY: Duration = Duration::from_secs(2);
const FRAME_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    /// The server reported the session gone; the stream will not be reopened.
    NotFound,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    Frame(StreamFrame),
    Error(String),
}

pub trait EventTransport: Send + Sync + 'static {
    fn open(
        &self,
        code: &str,
        player_id: Option<&str>,
    ) -> Result<BoxStream<'static, TransportEvent>, SyncError>;
}

/// Server-sent events from `GET /sessions/<code>/events`.
#[derive(Clone)]
pub struct HttpEventTransport {
    http: Client,
    base_url: String,
}

impl HttpEventTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl EventTransport for HttpEventTransport {
    fn open(
        &self,
        code: &str,
        player_id: Option<&str>,
    ) -> Result<BoxStream<'static, TransportEvent>, SyncError> {
        let mut request = self
            .http
            .get(format!("{}/sessions/{}/events", self.base_url, code));
        if let Some(player_id) = player_id {
            request = request.query(&[("playerId", player_id)]);
        }
        let source =
            EventSource::new(request).map_err(|err| SyncError::Unavailable(err.to_string()))?;
        Ok(source
            .map(|event| match event {
                Ok(Event::Open) => TransportEvent::Open,
                Ok(Event::Message(message)) => {
                    match serde_json::from_str::<StreamFrame>(&message.data) {
                        Ok(frame) => TransportEvent::Frame(frame),
                        Err(err) => TransportEvent::Error(format!("malformed frame: {err}")),
                    }
                }
                Err(err) => TransportEvent::Error(err.to_string()),
            })
            .boxed())
    }
}

pub struct SyncManager {
    transport: Arc<dyn EventTransport>,
    status: watch::Sender<ConnectionStatus>,
    task: Option<JoinHandle<()>>,
    code: Option<String>,
}

impl SyncManager {
    pub fn new(transport: Arc<dyn EventTransport>) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            transport,
            status,
            task: None,
            code: None,
        }
    }

    /// Connectivity of the current stream. Survives reconnects.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn current_code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// Starts streaming `code`, replacing any previous stream. Dropping the returned
    /// receiver stops the stream as well.
    pub fn connect(
        &mut self,
        code: &str,
        player_id: Option<&str>,
    ) -> mpsc::Receiver<SyncEnvelope> {
        self.disconnect();
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_BUFFER);
        self.status.send_replace(ConnectionStatus::Connecting);
        self.task = Some(tokio::spawn(run_stream(
            self.transport.clone(),
            code.to_string(),
            player_id.map(str::to_string),
            frames_tx,
            self.status.clone(),
        )));
        self.code = Some(code.to_string());
        info!(session = %code, "sync stream started");
        frames_rx
    }

    pub fn disconnect(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            self.status.send_replace(ConnectionStatus::Disconnected);
            if let Some(code) = self.code.take() {
                debug!(session = %code, "sync stream stopped");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|task| !task.is_finished()).unwrap_or(false)
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn set_status(status: &watch::Sender<ConnectionStatus>, next: ConnectionStatus) {
    status.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
}

async fn run_stream(
    transport: Arc<dyn EventTransport>,
    code: String,
    player_id: Option<String>,
    frames: mpsc::Sender<SyncEnvelope>,
    status: watch::Sender<ConnectionStatus>,
) {
    loop {
        match transport.open(&code, player_id.as_deref()) {
            Ok(mut events) => {
                while let Some(event) = events.next().await {
                    match event {
                        TransportEvent::Open => debug!(session = %code, "stream opened"),
                        TransportEvent::Frame(StreamFrame::Sync(envelope)) => {
                            set_status(&status, ConnectionStatus::Connected);
                            if frames.send(envelope).await.is_err() {
                                debug!(session = %code, "frame receiver dropped; stopping stream");
                                return;
                            }
                        }
                        TransportEvent::Frame(frame) if frame.is_not_found() => {
                            warn!(session = %code, "session not found; stream closed");
                            set_status(&status, ConnectionStatus::NotFound);
                            return;
                        }
                        TransportEvent::Frame(StreamFrame::Error { error }) => {
                            warn!(session = %code, %error, "server reported stream error");
                        }
                        TransportEvent::Error(error) => {
                            debug!(session = %code, %error, "stream transport error");
                            set_status(&status, ConnectionStatus::Disconnected);
                        }
                    }
                }
                debug!(session = %code, "stream ended; reopening");
            }
            Err(err) => warn!(session = %code, error = %err, "failed to open stream"),
        }
        set_status(&status, ConnectionStatus::Disconnected);
        if frames.is_closed() {
            return;
        }
        tokio::time::sleep(REOPEN_DELAY).await;
    }
}
