//! HTTP client for the session server.

use async_trait::async_trait;
use bingo_core::{
    ClaimRequest, ClaimResponse, CreateSessionRequest, CreateSessionResponse, HeartbeatRequest,
    HeartbeatResponse, JoinRequest, MarkRequest, PlayerState, SessionSnapshot,
};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

use crate::reconciler::ReconcileError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("session not found")]
    NotFound,
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    /// The server gave up on a contended write; the same request may succeed later.
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error("server error ({status})")]
    Server { status: u16 },
    #[error("http request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server unreachable: {0}")]
    Unavailable(String),
    #[error("invalid payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

impl SyncError {
    /// Failures worth retrying later. Everything else is a verdict on the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Conflict(_)
                | SyncError::Server { .. }
                | SyncError::Transport(_)
                | SyncError::Unavailable(_)
        )
    }
}

#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn fetch_session(
        &self,
        code: &str,
        viewer: Option<&str>,
    ) -> Result<SessionSnapshot, SyncError>;

    async fn join(&self, code: &str, request: &JoinRequest) -> Result<SessionSnapshot, SyncError>;

    async fn set_mark(&self, code: &str, request: &MarkRequest)
        -> Result<SessionSnapshot, SyncError>;

    async fn claim_win(&self, code: &str, claim: &ClaimRequest)
        -> Result<ClaimResponse, SyncError>;

    async fn heartbeat(&self, code: &str, player_id: &str) -> Result<HeartbeatResponse, SyncError>;

    async fn load_player_state(
        &self,
        code: &str,
        player_id: &str,
    ) -> Result<Option<PlayerState>, SyncError>;

    async fn save_player_state(&self, state: &PlayerState) -> Result<(), SyncError>;
}

#[derive(Clone)]
pub struct HttpSessionApi {
    http: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: Option<String>,
}

impl HttpSessionApi {
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

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn client(&self) -> &Client {
        &self.http
    }

    pub async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<CreateSessionResponse, SyncError> {
        let url = format!("{}/sessions", self.base_url);
        send(self.http.post(url).json(request)).await
    }

    fn session_url(&self, code: &str) -> String {
        format!("{}/sessions/{}", self.base_url, code)
    }

    fn player_url(&self, code: &str) -> String {
        format!("{}/players/{}", self.base_url, code)
    }
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    async fn fetch_session(
        &self,
        code: &str,
        viewer: Option<&str>,
    ) -> Result<SessionSnapshot, SyncError> {
        let mut request = self.http.get(self.session_url(code));
        if let Some(player_id) = viewer {
            request = request.query(&[("playerId", player_id)]);
        }
        send(request).await
    }

    async fn join(&self, code: &str, request: &JoinRequest) -> Result<SessionSnapshot, SyncError> {
        let url = format!("{}/players", self.session_url(code));
        send(self.http.post(url).json(request)).await
    }

    async fn set_mark(
        &self,
        code: &str,
        request: &MarkRequest,
    ) -> Result<SessionSnapshot, SyncError> {
        let url = format!("{}/marks", self.session_url(code));
        send(self.http.post(url).json(request)).await
    }

    async fn claim_win(
        &self,
        code: &str,
        claim: &ClaimRequest,
    ) -> Result<ClaimResponse, SyncError> {
        let url = format!("{}/claim-win", self.session_url(code));
        send(self.http.post(url).json(claim)).await
    }

    async fn heartbeat(&self, code: &str, player_id: &str) -> Result<HeartbeatResponse, SyncError> {
        let url = format!("{}/heartbeat", self.player_url(code));
        let body = HeartbeatRequest {
            player_id: player_id.to_string(),
        };
        send(self.http.post(url).json(&body)).await
    }

    async fn load_player_state(
        &self,
        code: &str,
        player_id: &str,
    ) -> Result<Option<PlayerState>, SyncError> {
        let request = self
            .http
            .get(self.player_url(code))
            .query(&[("playerId", player_id)]);
        match send(request).await {
            Ok(state) => Ok(Some(state)),
            Err(SyncError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn save_player_state(&self, state: &PlayerState) -> Result<(), SyncError> {
        let request = self
            .http
            .post(self.player_url(&state.code))
            .query(&[("playerId", state.player_id.as_str())])
            .json(state);
        let _: PlayerState = send(request).await?;
        Ok(())
    }
}

async fn send<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, SyncError> {
    let res = request.send().await?;
    let status = res.status();
    if status.is_success() {
        let bytes = res.bytes().await?;
        return Ok(serde_json::from_slice(&bytes)?);
    }
    let body = res.text().await.unwrap_or_default();
    Err(status_error(status, &body))
}

fn status_error(status: StatusCode, body: &str) -> SyncError {
    if status == StatusCode::NOT_FOUND {
        return SyncError::NotFound;
    }
    if status.is_server_error() {
        return SyncError::Server {
            status: status.as_u16(),
        };
    }
    let message = match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => parsed.message.unwrap_or(parsed.error),
        Err(_) => body.to_string(),
    };
    if status == StatusCode::CONFLICT {
        return SyncError::Conflict(message);
    }
    SyncError::Rejected {
        status: status.as_u16(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn retryable_errors_are_the_transient_ones() {
        assert!(SyncError::Server { status: 503 }.is_retryable());
        assert!(SyncError::Unavailable("offline".into()).is_retryable());
        assert!(SyncError::Conflict("busy".into()).is_retryable());
        assert!(!SyncError::NotFound.is_retryable());
        assert!(!SyncError::Rejected {
            status: 400,
            message: "bad".into()
        }
        .is_retryable());
    }

    #[test_timeout::timeout]
    fn statuses_map_to_errors() {
        let conflict = status_error(
            StatusCode::CONFLICT,
            r#"{"error":"conflict","message":"too much contention"}"#,
        );
        assert!(matches!(&conflict, SyncError::Conflict(msg) if msg == "too much contention"));
        assert!(conflict.is_retryable());

        let refused = status_error(StatusCode::BAD_REQUEST, r#"{"error":"bad_request"}"#);
        assert!(matches!(
            &refused,
            SyncError::Rejected { status: 400, message } if message == "bad_request"
        ));
        assert!(!refused.is_retryable());

        assert!(matches!(
            status_error(StatusCode::FORBIDDEN, "nope"),
            SyncError::Rejected { status: 403, .. }
        ));
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, ""),
            SyncError::NotFound
        ));
        assert!(status_error(StatusCode::BAD_GATEWAY, "").is_retryable());
    }

    #[test_timeout::timeout]
    fn base_url_is_normalized() {
        let api = HttpSessionApi::new("http://localhost:8080/");
        assert_eq!(api.base_url(), "http://localhost:8080");
        assert_eq!(api.session_url("ABC123"), "http://localhost:8080/sessions/ABC123");
        assert_eq!(api.player_url("ABC123"), "http://localhost:8080/players/ABC123");
    }
}
