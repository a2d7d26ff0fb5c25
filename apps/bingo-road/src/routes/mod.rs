mod players;
mod sessions;
mod stream;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::sessions::ServiceError;
use crate::state::AppState;

pub use players::*;
pub use sessions::*;
pub use stream::*;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(prometheus_metrics))
        .route("/sessions", post(create_session))
        .route("/sessions/:code", get(get_session).post(write_session))
        .route("/sessions/:code/events", get(stream_session))
        .route("/sessions/:code/players", post(join_session))
        .route("/sessions/:code/marks", post(set_mark))
        .route("/sessions/:code/claim-win", post(claim_win))
        .route("/players/:code/heartbeat", post(heartbeat))
        .route(
            "/players/:code",
            get(get_player_state).post(put_player_state),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

async fn prometheus_metrics(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<String, ApiError> {
    state
        .render_metrics()
        .ok_or(ApiError::NotFound("metrics recorder not installed"))
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    Forbidden(&'static str),
    NotFound(&'static str),
    Conflict(&'static str),
    BadRequest(String),
    Internal,
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", Some(msg.to_string())),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", Some(msg.to_string())),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", Some(msg.to_string())),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", Some(msg)),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal", None),
        };
        (status, Json(ApiErrorBody { error, message })).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::SessionNotFound => ApiError::NotFound("session not found"),
            ServiceError::PlayerNotFound(_) => ApiError::NotFound("player not found"),
            ServiceError::Invalid(err) => ApiError::BadRequest(err.to_string()),
            ServiceError::InvalidClaim(msg) => ApiError::BadRequest(msg),
            ServiceError::Forbidden => ApiError::Forbidden("admin secret required"),
            ServiceError::Conflict => ApiError::Conflict("too many concurrent writers; retry"),
            ServiceError::Store(err) => {
                error!(error = %err, "store failure");
                ApiError::Internal
            }
        }
    }
}
