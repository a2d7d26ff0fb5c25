use serde::{Deserialize, Serialize};

use crate::model::{Session, WinType, WinnerInfo};

/// Completions landing this close to the confirmed win get the "so close" signal.
pub const NEAR_MISS_WINDOW_MS: i64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    pub player_id: String,
    pub display_name: String,
    pub win_type: WinType,
    pub winning_positions: Vec<u32>,
    pub client_timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimResponse {
    pub accepted: bool,
    pub game: Session,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_winner: Option<WinnerInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearMiss {
    pub winner_id: String,
    pub winner_name: String,
    pub won_at: i64,
    /// How long after the winner the local player completed the card.
    pub time_difference_ms: i64,
}

impl NearMiss {
    /// `None` when the local completion is outside the window or the winner is `player_id`.
    pub fn evaluate(winner: &WinnerInfo, player_id: &str, completed_at: i64) -> Option<Self> {
        if winner.player_id == player_id {
            return None;
        }
        let time_difference_ms = completed_at - winner.won_at;
        if time_difference_ms.abs() >= NEAR_MISS_WINDOW_MS {
            return None;
        }
        Some(Self {
            winner_id: winner.player_id.clone(),
            winner_name: winner.display_name.clone(),
            won_at: winner.won_at,
            time_difference_ms,
        })
    }
}
