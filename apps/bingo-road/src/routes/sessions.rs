use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use bingo_core::{
    ClaimRequest, ClaimResponse, CreateSessionRequest, CreateSessionResponse, JoinRequest,
    MarkRequest, Session, SessionSnapshot,
};
use serde::Deserialize;
use tracing::debug;

use crate::arbiter;
use crate::codes::normalize_code;
use crate::state::AppState;

use super::{ApiError, ApiResult};

pub const ADMIN_SECRET_HEADER: &str = "x-admin-secret";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerQuery {
    pub player_id: Option<String>,
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ApiError> {
    let created = state.sessions.create(request).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Query(viewer): Query<ViewerQuery>,
) -> ApiResult<SessionSnapshot> {
    let code = normalize_code(&code);
    state
        .sessions
        .snapshot(&code, viewer.player_id.as_deref())
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound("session not found"))
}

pub async fn write_session(
    State(state): State<AppState>,
    Path(code): Path<String>,
    headers: HeaderMap,
    Json(document): Json<Session>,
) -> ApiResult<SessionSnapshot> {
    let code = normalize_code(&code);
    let admin_secret = headers
        .get(ADMIN_SECRET_HEADER)
        .and_then(|value| value.to_str().ok());
    debug!(session = %code, admin = admin_secret.is_some(), "document write");
    let session = state
        .sessions
        .write_document(&code, document, admin_secret)
        .await?;
    Ok(Json(state.sessions.view(&session, None)))
}

pub async fn join_session(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(request): Json<JoinRequest>,
) -> ApiResult<SessionSnapshot> {
    let code = normalize_code(&code);
    let viewer = request.player_id.clone();
    let session = state.sessions.join(&code, request).await?;
    Ok(Json(state.sessions.view(&session, Some(&viewer))))
}

pub async fn set_mark(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(request): Json<MarkRequest>,
) -> ApiResult<SessionSnapshot> {
    let code = normalize_code(&code);
    let viewer = request.player_id.clone();
    let session = state.sessions.set_mark(&code, request).await?;
    Ok(Json(state.sessions.view(&session, Some(&viewer))))
}

pub async fn claim_win(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(claim): Json<ClaimRequest>,
) -> ApiResult<ClaimResponse> {
    let code = normalize_code(&code);
    Ok(Json(arbiter::claim_win(&state.sessions, &code, claim).await?))
}
