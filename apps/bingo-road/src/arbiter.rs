//! Win arbitration.
//!
//! A claim is a guarded write of `winner`: the first one to land against a
//! winner-less document wins, every later claim re-reads, finds the winner and is
//! rejected with it. `won_at` is server time.

use std::collections::HashSet;

use bingo_core::{ChangeKind, ClaimRequest, ClaimResponse, Session, WinType, WinnerInfo};
use tracing::info;

use crate::metrics;
use crate::sessions::{Outcome, ServiceError, SessionService};

enum Verdict {
    Won,
    Lost(WinnerInfo),
}

pub async fn claim_win(
    service: &SessionService,
    code: &str,
    claim: ClaimRequest,
) -> Result<ClaimResponse, ServiceError> {
    if claim.player_id.trim().is_empty() {
        return Err(ServiceError::InvalidClaim("playerId is required".into()));
    }

    let (session, verdict) = service
        .mutate(code, |session, now| {
            if let Some(winner) = &session.winner {
                return Ok(Outcome::Abort(Verdict::Lost(winner.clone())));
            }
            check_positions(session, &claim)?;

            session.upsert_player(&claim.player_id, &claim.display_name, now)?;
            if let Some(player) = session.player_mut(&claim.player_id) {
                player.has_won = true;
            }
            session.winner = Some(WinnerInfo {
                player_id: claim.player_id.clone(),
                display_name: claim.display_name.clone(),
                won_at: now,
                win_type: claim.win_type,
                winning_positions: claim.winning_positions.clone(),
            });
            Ok(Outcome::Commit(ChangeKind::GameWon, Verdict::Won))
        })
        .await?;

    let game = service.view(&session, Some(&claim.player_id)).session;
    let response = match verdict {
        Verdict::Won => {
            info!(session = %code, player = %claim.player_id, "win confirmed");
            ClaimResponse {
                accepted: true,
                game,
                actual_winner: None,
            }
        }
        Verdict::Lost(winner) => {
            info!(
                session = %code,
                player = %claim.player_id,
                winner = %winner.player_id,
                "claim rejected; session already won"
            );
            ClaimResponse {
                accepted: false,
                game,
                actual_winner: Some(winner),
            }
        }
    };
    metrics::claim_outcome(response.accepted);
    Ok(response)
}

/// The claimed positions must be distinct items on this card that the claimant has
/// marked, and they must form the claimed pattern: every item for a full card, one
/// row, column or diagonal of the grid for a line.
fn check_positions(session: &Session, claim: &ClaimRequest) -> Result<(), ServiceError> {
    let mut seen = HashSet::new();
    for position in &claim.winning_positions {
        if !seen.insert(*position) {
            return Err(ServiceError::InvalidClaim(format!(
                "position {position} listed twice"
            )));
        }
        let Some(item) = session.item(*position) else {
            return Err(ServiceError::InvalidClaim(format!(
                "no item at position {position}"
            )));
        };
        if !item.is_marked_by(&claim.player_id) {
            return Err(ServiceError::InvalidClaim(format!(
                "position {position} is not marked by {}",
                claim.player_id
            )));
        }
    }

    match claim.win_type {
        WinType::FullCard if !session.is_complete(&claim.winning_positions) => Err(
            ServiceError::InvalidClaim("full card claims must cover every item".into()),
        ),
        WinType::Line if session.settings.require_full_completion => Err(
            ServiceError::InvalidClaim("this session only accepts full card wins".into()),
        ),
        WinType::Line if !session.is_line(&claim.winning_positions) => {
            Err(ServiceError::InvalidClaim(format!(
                "line claims need one full row, column or diagonal of the {0}x{0} grid",
                session.settings.grid_size
            )))
        }
        _ => Ok(()),
    }
}
