use axum::{
    extract::{Path, Query, State},
    Json,
};
use bingo_core::{HeartbeatRequest, HeartbeatResponse, PlayerState};

use crate::codes::normalize_code;
use crate::state::AppState;

use super::{ApiError, ApiResult, ViewerQuery};

pub async fn heartbeat(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(request): Json<HeartbeatRequest>,
) -> ApiResult<HeartbeatResponse> {
    let code = normalize_code(&code);
    let session = state.sessions.heartbeat(&code, &request.player_id).await?;
    let view = state.sessions.view(&session, Some(&request.player_id));
    let last_seen_at = view
        .session
        .player(&request.player_id)
        .map(|player| player.last_seen_at)
        .unwrap_or_default();
    Ok(Json(HeartbeatResponse {
        last_seen_at,
        online_count: view.online_count,
    }))
}

pub async fn get_player_state(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Query(viewer): Query<ViewerQuery>,
) -> ApiResult<PlayerState> {
    let code = normalize_code(&code);
    let player_id = viewer
        .player_id
        .ok_or_else(|| ApiError::BadRequest("playerId query parameter is required".into()))?;
    state
        .sessions
        .player_state(&code, &player_id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound("player state not found"))
}

pub async fn put_player_state(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Query(viewer): Query<ViewerQuery>,
    Json(player_state): Json<PlayerState>,
) -> ApiResult<PlayerState> {
    let code = normalize_code(&code);
    let player_id = viewer
        .player_id
        .unwrap_or_else(|| player_state.player_id.clone());
    let saved = state
        .sessions
        .save_player_state(&code, &player_id, player_state)
        .await?;
    Ok(Json(saved))
}
