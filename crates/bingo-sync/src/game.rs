//! Player-facing handle on one joined session.
//!
//! A [`GameSession`] owns the session's [`Reconciler`] and its offline queue behind
//! one async mutex. The lock is never held across a network call: local edits are
//! applied, the lock is released, the request goes out, and the answer settles the
//! edit under the lock again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bingo_core::{
    presence::HEARTBEAT_INTERVAL, ClaimRequest, Clock, HeartbeatResponse, JoinRequest, MarkRequest,
    NearMiss, PlayerState, Session, SessionSnapshot, SyncEnvelope, WinType, WinnerInfo,
};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{SessionApi, SyncError};
use crate::command::LocalCommand;
use crate::manager::ConnectionStatus;
use crate::pending::{PendingOp, PendingQueue};
use crate::reconciler::{MergeReport, ReconcileError, Reconciler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WinState {
    NoWinner,
    /// Claimed locally, server answer outstanding.
    WinPending,
    Confirmed,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Confirmed(WinnerInfo),
    /// Someone else won first. Expected, not an error.
    Rejected {
        winner: WinnerInfo,
        near_miss: Option<NearMiss>,
    },
    /// The card is not complete; nothing was sent.
    Incomplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Synced,
    /// Kept locally; delivered by the next flush.
    Queued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkOutcome {
    pub delivery: Delivery,
    /// This toggle finished the card. Time to claim.
    pub completed_card: bool,
}

struct Inner {
    reconciler: Reconciler,
    pending: PendingQueue,
    win_state: WinState,
}

pub struct GameSession {
    api: Arc<dyn SessionApi>,
    clock: Arc<dyn Clock>,
    code: String,
    player_id: String,
    display_name: String,
    inner: Mutex<Inner>,
    foreground: AtomicBool,
}

impl GameSession {
    /// Joins `code` as `player_id`, restoring the player's saved record when the
    /// server has one.
    pub async fn join(
        api: Arc<dyn SessionApi>,
        clock: Arc<dyn Clock>,
        code: &str,
        player_id: &str,
        display_name: &str,
        admin_secret: Option<String>,
    ) -> Result<Arc<Self>, SyncError> {
        let request = JoinRequest {
            player_id: player_id.to_string(),
            display_name: display_name.to_string(),
        };
        let snapshot = api.join(code, &request).await?;
        let code = snapshot.session.code.clone();

        let player_state = match api.load_player_state(&code, player_id).await {
            Ok(Some(state)) => state,
            Ok(None) => seed_player_state(&snapshot.session, player_id, display_name, clock.now_ms()),
            Err(err) if err.is_retryable() => {
                warn!(session = %code, error = %err, "player record unavailable; starting fresh");
                seed_player_state(&snapshot.session, player_id, display_name, clock.now_ms())
            }
            Err(err) => return Err(err),
        };

        let mut reconciler = Reconciler::new(player_state, admin_secret, clock.clone());
        reconciler.apply(SyncEnvelope::Full(snapshot))?;
        let win_state = match reconciler.confirmed_winner() {
            Some(winner) if winner.player_id == player_id => WinState::Confirmed,
            Some(_) => WinState::Rejected,
            None => WinState::NoWinner,
        };
        if let Err(err) = api.save_player_state(reconciler.player_state()).await {
            warn!(session = %code, error = %err, "failed to save player record on join");
        }
        info!(session = %code, player_id = %player_id, "joined session");

        Ok(Arc::new(Self {
            api,
            clock,
            code,
            player_id: player_id.to_string(),
            display_name: display_name.to_string(),
            inner: Mutex::new(Inner {
                reconciler,
                pending: PendingQueue::new(),
                win_state,
            }),
            foreground: AtomicBool::new(true),
        }))
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn player_id(&self) -> &str {
        &self.player_id
    }

    pub async fn current_game(&self) -> Option<Session> {
        self.inner.lock().await.reconciler.current_game().cloned()
    }

    pub async fn player_state(&self) -> PlayerState {
        self.inner.lock().await.reconciler.player_state().clone()
    }

    pub async fn near_miss(&self) -> Option<NearMiss> {
        self.inner.lock().await.reconciler.near_miss().cloned()
    }

    pub async fn online_count(&self) -> usize {
        self.inner.lock().await.reconciler.online_count()
    }

    pub async fn win_state(&self) -> WinState {
        self.inner.lock().await.win_state
    }

    pub async fn pending_len(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    /// Merges one pushed or polled frame.
    pub async fn apply(&self, envelope: SyncEnvelope) -> Result<MergeReport, ReconcileError> {
        let mut inner = self.inner.lock().await;
        self.merge(&mut inner, envelope)
    }

    fn merge(
        &self,
        inner: &mut Inner,
        envelope: SyncEnvelope,
    ) -> Result<MergeReport, ReconcileError> {
        let report = inner.reconciler.apply(envelope)?;
        if let Some(winner) = &report.winner_confirmed {
            inner.win_state = if winner.player_id == self.player_id {
                WinState::Confirmed
            } else {
                WinState::Rejected
            };
        }
        Ok(report)
    }

    /// Flips the player's mark on `position`. The local view changes immediately;
    /// a write the server cannot be reached for is queued instead of lost, and a
    /// write the server refuses is rolled back. The outcome says whether this
    /// toggle completed the card, which is the cue for [`claim_full_card`].
    ///
    /// [`claim_full_card`]: Self::claim_full_card
    pub async fn toggle_mark(&self, position: u32) -> Result<MarkOutcome, SyncError> {
        let (tentative, request, completed_card) = {
            let mut inner = self.inner.lock().await;
            let was_complete = inner.reconciler.is_card_complete();
            let marked = !inner.reconciler.player_state().has_marked(position);
            let tentative = inner
                .reconciler
                .apply_local(LocalCommand::SetMark { position, marked })?;
            // This write supersedes anything still queued for the position.
            inner.pending.discard(position);
            let completed_card = !was_complete && inner.reconciler.is_card_complete();
            (tentative, self.mark_request(position, marked), completed_card)
        };
        if completed_card {
            info!(session = %self.code, "card complete");
        }

        match self.api.set_mark(&self.code, &request).await {
            Ok(snapshot) => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.reconciler.commit(tentative);
                    self.merge(&mut inner, SyncEnvelope::Full(snapshot))?;
                }
                self.save_player_state().await;
                Ok(MarkOutcome {
                    delivery: Delivery::Synced,
                    completed_card,
                })
            }
            Err(err) if err.is_retryable() => {
                debug!(session = %self.code, position, error = %err, "mark queued");
                let mut inner = self.inner.lock().await;
                inner.reconciler.commit(tentative);
                inner.pending.push(PendingOp::Mark(request));
                Ok(MarkOutcome {
                    delivery: Delivery::Queued,
                    completed_card,
                })
            }
            Err(err) => {
                warn!(session = %self.code, position, error = %err, "mark refused; rolling back");
                self.inner.lock().await.reconciler.rollback(tentative);
                Err(err)
            }
        }
    }

    /// Replays queued writes in order. Stops at the first one the server cannot be
    /// reached for, leaving it and the rest queued. Returns how many were delivered.
    pub async fn flush_pending(&self) -> Result<usize, SyncError> {
        let mut delivered = 0;
        loop {
            let Some(op) = self.inner.lock().await.pending.front().cloned() else {
                break;
            };
            let PendingOp::Mark(request) = &op;
            let result = self.api.set_mark(&self.code, request).await;

            let mut inner = self.inner.lock().await;
            // A toggle made meanwhile may have superseded this write.
            let still_front = inner.pending.front() == Some(&op);
            match result {
                Ok(snapshot) => {
                    if still_front {
                        inner.pending.pop_front();
                    }
                    self.merge(&mut inner, SyncEnvelope::Full(snapshot))?;
                    delivered += 1;
                }
                Err(err) if err.is_retryable() => return Err(err),
                Err(err) => {
                    warn!(
                        session = %self.code,
                        position = request.position,
                        error = %err,
                        "queued mark refused; reverting"
                    );
                    if !still_front {
                        continue;
                    }
                    inner.pending.pop_front();
                    if let Ok(revert) = inner.reconciler.apply_local(LocalCommand::SetMark {
                        position: request.position,
                        marked: !request.marked,
                    }) {
                        inner.reconciler.commit(revert);
                    }
                }
            }
        }
        if delivered > 0 {
            info!(session = %self.code, delivered, "queued marks delivered");
            self.save_player_state().await;
        }
        Ok(delivered)
    }

    /// Claims a full-card win with every marked position.
    pub async fn claim_full_card(&self) -> Result<ClaimOutcome, SyncError> {
        let positions = {
            let inner = self.inner.lock().await;
            if !inner.reconciler.is_card_complete() {
                return Ok(ClaimOutcome::Incomplete);
            }
            inner.reconciler.player_state().marked_positions.clone()
        };
        self.claim_win(WinType::FullCard, positions).await
    }

    pub async fn claim_win(
        &self,
        win_type: WinType,
        winning_positions: Vec<u32>,
    ) -> Result<ClaimOutcome, SyncError> {
        // The server has to see every mark the claim depends on.
        self.flush_pending().await?;
        let snapshot = self
            .api
            .fetch_session(&self.code, Some(&self.player_id))
            .await?;

        let (tentative, claim) = {
            let mut inner = self.inner.lock().await;
            inner.reconciler.apply(SyncEnvelope::Full(snapshot))?;
            if let Some(winner) = inner.reconciler.confirmed_winner().cloned() {
                return Ok(self.settle_existing_winner(&mut inner, winner));
            }
            let tentative = inner.reconciler.apply_local(LocalCommand::ClaimWin {
                win_type,
                winning_positions: winning_positions.clone(),
            })?;
            inner.win_state = WinState::WinPending;
            let claim = ClaimRequest {
                player_id: self.player_id.clone(),
                display_name: self.display_name.clone(),
                win_type,
                winning_positions,
                client_timestamp: inner
                    .reconciler
                    .completed_at()
                    .unwrap_or_else(|| self.clock.now_ms()),
            };
            (tentative, claim)
        };

        let result = self.api.claim_win(&self.code, &claim).await;
        let mut inner = self.inner.lock().await;
        match result {
            Ok(response) if response.accepted => {
                inner.reconciler.commit(tentative);
                inner.reconciler.apply(snapshot_of(response.game))?;
                inner.win_state = WinState::Confirmed;
                let winner = inner
                    .reconciler
                    .confirmed_winner()
                    .cloned()
                    .ok_or(SyncError::Rejected {
                        status: 200,
                        message: "accepted claim carried no winner".into(),
                    })?;
                info!(session = %self.code, "win confirmed");
                Ok(ClaimOutcome::Confirmed(winner))
            }
            Ok(response) => {
                inner.reconciler.rollback(tentative);
                let actual = response.actual_winner.clone();
                inner.reconciler.apply(snapshot_of(response.game))?;
                let winner = actual
                    .or_else(|| inner.reconciler.confirmed_winner().cloned())
                    .ok_or(SyncError::Rejected {
                        status: 200,
                        message: "rejected claim carried no winner".into(),
                    })?;
                Ok(self.settle_existing_winner(&mut inner, winner))
            }
            Err(err) => {
                // No verdict came back; the claim can be sent again.
                inner.reconciler.rollback(tentative);
                inner.win_state = WinState::NoWinner;
                debug!(
                    session = %self.code,
                    error = %err,
                    retryable = err.is_retryable(),
                    "claim not settled"
                );
                Err(err)
            }
        }
    }

    fn settle_existing_winner(&self, inner: &mut Inner, winner: WinnerInfo) -> ClaimOutcome {
        if winner.player_id == self.player_id {
            inner.win_state = WinState::Confirmed;
            return ClaimOutcome::Confirmed(winner);
        }
        inner.win_state = WinState::Rejected;
        let near_miss = inner.reconciler.settle_near_miss(&winner);
        info!(
            session = %self.code,
            winner = %winner.player_id,
            near_miss = near_miss.is_some(),
            "claim lost"
        );
        ClaimOutcome::Rejected { winner, near_miss }
    }

    /// Reports presence unless the app is in the background.
    pub async fn heartbeat(&self) -> Result<Option<HeartbeatResponse>, SyncError> {
        if !self.is_foreground() {
            return Ok(None);
        }
        self.api
            .heartbeat(&self.code, &self.player_id)
            .await
            .map(Some)
    }

    pub fn is_foreground(&self) -> bool {
        self.foreground.load(Ordering::SeqCst)
    }

    /// Coming back to the foreground reports presence and flushes queued writes.
    pub async fn set_foreground(&self, foreground: bool) {
        let was = self.foreground.swap(foreground, Ordering::SeqCst);
        if foreground && !was {
            if let Err(err) = self.heartbeat().await {
                debug!(session = %self.code, error = %err, "heartbeat failed");
            }
            if let Err(err) = self.flush_pending().await {
                debug!(session = %self.code, error = %err, "flush on foreground failed");
            }
        }
    }

    /// Heartbeats and retries queued writes on a fixed cadence.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(err) = session.heartbeat().await {
                    debug!(session = %session.code, error = %err, "heartbeat failed");
                }
                if session.pending_len().await > 0 {
                    if let Err(err) = session.flush_pending().await {
                        debug!(session = %session.code, error = %err, "periodic flush failed");
                    }
                }
            }
        })
    }

    /// Applies frames from a sync stream or poller, and flushes queued writes every
    /// time the stream reconnects.
    pub fn follow(
        self: &Arc<Self>,
        mut frames: mpsc::Receiver<SyncEnvelope>,
        mut status: watch::Receiver<ConnectionStatus>,
    ) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            let mut status_open = true;
            loop {
                tokio::select! {
                    frame = frames.recv() => match frame {
                        Some(envelope) => {
                            if let Err(err) = session.apply(envelope).await {
                                warn!(session = %session.code, error = %err, "dropping frame");
                            }
                        }
                        None => break,
                    },
                    changed = status.changed(), if status_open => {
                        if changed.is_err() {
                            status_open = false;
                            continue;
                        }
                        let connected = *status.borrow_and_update() == ConnectionStatus::Connected;
                        if connected {
                            if let Err(err) = session.flush_pending().await {
                                debug!(session = %session.code, error = %err, "flush on reconnect failed");
                            }
                        }
                    }
                }
            }
        })
    }

    fn mark_request(&self, position: u32, marked: bool) -> MarkRequest {
        MarkRequest {
            player_id: self.player_id.clone(),
            display_name: self.display_name.clone(),
            position,
            marked,
        }
    }

    async fn save_player_state(&self) {
        let state = self.player_state().await;
        if let Err(err) = self.api.save_player_state(&state).await {
            debug!(session = %self.code, error = %err, "failed to save player record");
        }
    }
}

fn seed_player_state(session: &Session, player_id: &str, display_name: &str, now: i64) -> PlayerState {
    let mut state = PlayerState::new(session.code.clone(), player_id, display_name, now);
    state.marked_positions = session.positions_marked_by(player_id);
    state.has_won = session
        .winner
        .as_ref()
        .map(|winner| winner.player_id == player_id)
        .unwrap_or(false);
    state
}

fn snapshot_of(session: Session) -> SyncEnvelope {
    SyncEnvelope::Full(SessionSnapshot {
        session,
        online_count: 0,
    })
}
