//! Merges server frames into one viewer's local state.
//!
//! The reconciler keeps the last document the server sent (`last_server_state`)
//! and derives the displayed document (`current_game`) from it by layering local
//! truth on top: the admin token this client holds, the player's own marks from
//! `player_state`, presence as seen right now, and an optimistic win claim still
//! awaiting the server's answer. Every merge and every local command rebuilds the
//! displayed document that way, so optimistic state never flickers away when a
//! frame lands.

use std::sync::Arc;

use bingo_core::{
    presence, Clock, Item, Mark, NearMiss, PlayerState, Session, SessionDelta, SyncEnvelope,
    WinnerInfo,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::command::{Checkpoint, LocalCommand, Tentative};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("no session document received yet")]
    NoSession,
    #[error("frame belongs to session {found}, expected {expected}")]
    CodeMismatch { expected: String, found: String },
    #[error("no item at position {0}")]
    UnknownPosition(u32),
    #[error("session already won by {0}")]
    AlreadyWon(String),
}

/// What a merge changed that the player should hear about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// `false` when the frame was older than what is already known.
    pub applied: bool,
    /// The server's winner was seen for the first time in this frame.
    pub winner_confirmed: Option<WinnerInfo>,
    pub near_miss: Option<NearMiss>,
    /// A local optimistic win was withdrawn because someone else won.
    pub rolled_back_win: bool,
}

pub struct Reconciler {
    clock: Arc<dyn Clock>,
    admin_secret: Option<String>,
    player_state: PlayerState,
    last_server_state: Option<Session>,
    current_game: Option<Session>,
    optimistic_winner: Option<WinnerInfo>,
    online_count: usize,
    completed_at: Option<i64>,
    near_miss: Option<NearMiss>,
}

impl Reconciler {
    pub fn new(
        player_state: PlayerState,
        admin_secret: Option<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            clock,
            admin_secret,
            player_state,
            last_server_state: None,
            current_game: None,
            optimistic_winner: None,
            online_count: 0,
            completed_at: None,
            near_miss: None,
        }
    }

    pub fn code(&self) -> &str {
        &self.player_state.code
    }

    pub fn player_id(&self) -> &str {
        &self.player_state.player_id
    }

    pub fn player_state(&self) -> &PlayerState {
        &self.player_state
    }

    pub fn current_game(&self) -> Option<&Session> {
        self.current_game.as_ref()
    }

    pub fn last_server_state(&self) -> Option<&Session> {
        self.last_server_state.as_ref()
    }

    pub fn admin_secret(&self) -> Option<&str> {
        self.admin_secret.as_deref()
    }

    pub fn online_count(&self) -> usize {
        self.online_count
    }

    pub fn near_miss(&self) -> Option<&NearMiss> {
        self.near_miss.as_ref()
    }

    pub fn completed_at(&self) -> Option<i64> {
        self.completed_at
    }

    pub fn is_card_complete(&self) -> bool {
        self.current_game
            .as_ref()
            .map(|game| game.is_complete(&self.player_state.marked_positions))
            .unwrap_or(false)
    }

    /// The winner the server has confirmed, ignoring any local optimistic claim.
    pub fn confirmed_winner(&self) -> Option<&WinnerInfo> {
        self.last_server_state.as_ref()?.winner.as_ref()
    }

    pub fn apply(&mut self, envelope: SyncEnvelope) -> Result<MergeReport, ReconcileError> {
        let mut incoming = match envelope {
            SyncEnvelope::Full(snapshot) => {
                if snapshot.session.code != self.player_state.code {
                    return Err(ReconcileError::CodeMismatch {
                        expected: self.player_state.code.clone(),
                        found: snapshot.session.code,
                    });
                }
                snapshot.session
            }
            SyncEnvelope::Delta(delta) => {
                let base = self
                    .last_server_state
                    .as_ref()
                    .ok_or(ReconcileError::NoSession)?;
                merge_delta(base, delta)
            }
        };

        let previous_winner = match &self.last_server_state {
            Some(known) => {
                if (incoming.version, incoming.last_modified_at)
                    < (known.version, known.last_modified_at)
                {
                    debug!(
                        session = %self.player_state.code,
                        version = incoming.version,
                        known = known.version,
                        "ignoring stale frame"
                    );
                    return Ok(MergeReport::default());
                }
                preserve_text(&known.items, &mut incoming.items);
                if incoming.winner.is_none() {
                    incoming.winner = known.winner.clone();
                }
                known.winner.clone()
            }
            None => None,
        };
        incoming.admin_secret = None;
        self.last_server_state = Some(incoming);

        let mut report = MergeReport {
            applied: true,
            ..MergeReport::default()
        };
        let winner = self.confirmed_winner().cloned();
        if let Some(winner) = winner.filter(|w| previous_winner.as_ref() != Some(w)) {
            self.on_winner(&winner, &mut report);
            report.winner_confirmed = Some(winner);
        }
        self.rebuild();
        Ok(report)
    }

    /// Applies a local edit optimistically. The returned [`Tentative`] must be handed
    /// back to [`commit`](Self::commit) or [`rollback`](Self::rollback).
    pub fn apply_local(&mut self, command: LocalCommand) -> Result<Tentative, ReconcileError> {
        let game = self.current_game.as_ref().ok_or(ReconcileError::NoSession)?;
        let checkpoint = Checkpoint {
            player_state: self.player_state.clone(),
            winner: game.winner.clone(),
            completed_at: self.completed_at,
        };

        match &command {
            LocalCommand::SetMark { position, marked } => {
                if game.item(*position).is_none() {
                    return Err(ReconcileError::UnknownPosition(*position));
                }
                self.player_state.set_marked(*position, *marked);
            }
            LocalCommand::ClaimWin {
                win_type,
                winning_positions,
            } => {
                if let Some(winner) = self.confirmed_winner() {
                    if winner.player_id != self.player_state.player_id {
                        return Err(ReconcileError::AlreadyWon(winner.display_name.clone()));
                    }
                }
                self.player_state.has_won = true;
                self.optimistic_winner = Some(WinnerInfo {
                    player_id: self.player_state.player_id.clone(),
                    display_name: self.player_state.display_name.clone(),
                    won_at: self.clock.now_ms(),
                    win_type: *win_type,
                    winning_positions: winning_positions.clone(),
                });
            }
        }
        self.rebuild();
        Ok(Tentative::new(command, checkpoint))
    }

    pub fn commit(&mut self, tentative: Tentative) {
        let (command, _) = tentative.into_parts();
        if let LocalCommand::ClaimWin { .. } = command {
            // The confirmed winner arrives with the server's document.
            self.optimistic_winner = None;
        }
        self.player_state.last_sync_at = self.clock.now_ms();
        self.rebuild();
    }

    /// Undoes exactly what the command changed. Frames merged since it was applied
    /// are kept.
    pub fn rollback(&mut self, tentative: Tentative) {
        let (command, checkpoint) = tentative.into_parts();
        match command {
            LocalCommand::SetMark { position, .. } => {
                let was_marked = checkpoint.player_state.has_marked(position);
                self.player_state.set_marked(position, was_marked);
            }
            LocalCommand::ClaimWin { .. } => {
                self.optimistic_winner = None;
                let confirmed_self = self
                    .confirmed_winner()
                    .map(|w| w.player_id == self.player_state.player_id)
                    .unwrap_or(false);
                self.player_state.has_won = confirmed_self || checkpoint.player_state.has_won;
            }
        }
        self.rebuild();
        if self.completed_at.is_some() && checkpoint.completed_at.is_some() {
            self.completed_at = checkpoint.completed_at;
        }
        debug!(session = %self.player_state.code, "local edit rolled back");
    }

    /// Replaces the player record, e.g. after loading it from the server.
    pub fn replace_player_state(&mut self, player_state: PlayerState) {
        self.player_state = player_state;
        self.rebuild();
    }

    fn on_winner(&mut self, winner: &WinnerInfo, report: &mut MergeReport) {
        self.optimistic_winner = None;
        if winner.player_id == self.player_state.player_id {
            self.player_state.has_won = true;
            self.near_miss = None;
            info!(session = %self.player_state.code, "win confirmed for this player");
            return;
        }
        if self.player_state.has_won {
            self.player_state.has_won = false;
            report.rolled_back_win = true;
        }
        self.near_miss = None;
        report.near_miss = self.settle_near_miss(winner);
        info!(
            session = %self.player_state.code,
            winner = %winner.player_id,
            near_miss = self.near_miss.is_some(),
            "session won by another player"
        );
    }

    /// How close this player came to `winner`. The first verdict against a winner is
    /// kept; a card completed after the win is still measured.
    pub fn settle_near_miss(&mut self, winner: &WinnerInfo) -> Option<NearMiss> {
        if winner.player_id == self.player_state.player_id {
            return None;
        }
        if self.near_miss.is_none() {
            self.near_miss = self.completed_at.and_then(|completed_at| {
                NearMiss::evaluate(winner, &self.player_state.player_id, completed_at)
            });
        }
        self.near_miss.clone()
    }

    fn rebuild(&mut self) {
        let Some(server) = &self.last_server_state else {
            return;
        };
        let now = self.clock.now_ms();
        let confirmed = server.winner.clone();
        let mut game = server.clone();
        game.admin_secret = self.admin_secret.clone();
        if game.winner.is_none() {
            game.winner = self.optimistic_winner.clone();
        }
        project_marks(&mut game, &self.player_state, now);
        if let Some(me) = game.player_mut(&self.player_state.player_id) {
            me.has_won = self.player_state.has_won;
        }
        self.online_count =
            presence::refresh(&mut game.players, now, Some(&self.player_state.player_id));

        if !game.is_complete(&self.player_state.marked_positions) {
            self.completed_at = None;
        } else if self.completed_at.is_none() {
            self.completed_at = Some(now);
            // A card restored complete on the first build has no known completion time.
            if let Some(winner) = confirmed.filter(|_| self.current_game.is_some()) {
                self.settle_near_miss(&winner);
            }
        }
        self.current_game = Some(game);
    }
}

/// Rewrites the player's own marks on every item from `player_state`.
fn project_marks(game: &mut Session, me: &PlayerState, now: i64) {
    for item in &mut game.items {
        let existing = item
            .marked_by
            .iter()
            .position(|mark| mark.player_id == me.player_id);
        match (me.has_marked(item.position), existing) {
            (true, None) => item.marked_by.push(Mark {
                player_id: me.player_id.clone(),
                display_name: me.display_name.clone(),
                marked_at: now,
            }),
            (false, Some(idx)) => {
                item.marked_by.remove(idx);
            }
            _ => {}
        }
    }
}

/// Empty text in a frame means "unknown", never "cleared".
fn preserve_text(known: &[Item], incoming: &mut [Item]) {
    for item in incoming.iter_mut().filter(|item| item.text.is_empty()) {
        if let Some(previous) = known.iter().find(|k| k.position == item.position) {
            item.text = previous.text.clone();
        }
    }
}

fn merge_delta(base: &Session, delta: SessionDelta) -> Session {
    let mut merged = base.clone();
    if let Some(title) = delta.title.filter(|title| !title.is_empty()) {
        merged.title = title;
    }
    for patch in delta.items.unwrap_or_default() {
        match merged.item_mut(patch.position) {
            Some(item) => {
                if let Some(id) = patch.id {
                    item.id = id;
                }
                if let Some(text) = patch.text.filter(|text| !text.is_empty()) {
                    item.text = text;
                }
                if let Some(marked_by) = patch.marked_by {
                    item.marked_by = marked_by;
                }
            }
            None => merged.items.push(Item {
                id: patch
                    .id
                    .unwrap_or_else(|| format!("item-{}", patch.position)),
                text: patch.text.unwrap_or_default(),
                position: patch.position,
                marked_by: patch.marked_by.unwrap_or_default(),
            }),
        }
    }
    if let Some(players) = delta.players {
        merged.players = players;
    }
    if merged.winner.is_none() {
        merged.winner = delta.winner;
    }
    if let Some(last_modified_at) = delta.last_modified_at {
        merged.last_modified_at = merged.last_modified_at.max(last_modified_at);
    }
    if let Some(version) = delta.version {
        merged.version = merged.version.max(version);
    }
    merged
}

#[cfg(test)]
mod tests {
    use bingo_core::{
        ItemPatch, ManualClock, Player, SessionSnapshot, Settings, WinType, NEAR_MISS_WINDOW_MS,
    };

    use super::*;

    fn session(version: u64, last_modified_at: i64) -> Session {
        let mut session = Session::new(
            "s-1",
            "ABC123",
            "Road trip",
            vec![
                Item::new("i-0", "Dog barks", 0),
                Item::new("i-1", "Red car", 1),
                Item::new("i-2", "Bridge", 2),
            ],
            Settings::default(),
            0,
        );
        session.version = version;
        session.last_modified_at = last_modified_at;
        session
    }

    fn full(session: Session) -> SyncEnvelope {
        SyncEnvelope::Full(SessionSnapshot {
            session,
            online_count: 0,
        })
    }

    fn reconciler(clock: Arc<ManualClock>) -> Reconciler {
        Reconciler::new(
            PlayerState::new("ABC123", "carol", "Carol", 0),
            Some("admin-token".into()),
            clock,
        )
    }

    fn winner(player: &str, won_at: i64) -> WinnerInfo {
        WinnerInfo {
            player_id: player.into(),
            display_name: player.into(),
            won_at,
            win_type: WinType::FullCard,
            winning_positions: vec![0, 1, 2],
        }
    }

    fn mark(reconciler: &mut Reconciler, position: u32) {
        let tentative = reconciler
            .apply_local(LocalCommand::SetMark {
                position,
                marked: true,
            })
            .unwrap();
        reconciler.commit(tentative);
    }

    #[test_timeout::timeout]
    fn delta_without_text_keeps_known_text() {
        let clock = Arc::new(ManualClock::new(1_000));
        let mut r = reconciler(clock);
        r.apply(full(session(1, 100))).unwrap();

        let delta = SessionDelta {
            items: Some(vec![
                ItemPatch {
                    position: 0,
                    marked_by: Some(vec![Mark {
                        player_id: "alice".into(),
                        display_name: "Alice".into(),
                        marked_at: 150,
                    }]),
                    ..ItemPatch::default()
                },
                ItemPatch {
                    position: 1,
                    text: Some(String::new()),
                    ..ItemPatch::default()
                },
            ]),
            last_modified_at: Some(150),
            version: Some(2),
            ..SessionDelta::default()
        };
        let report = r.apply(SyncEnvelope::Delta(delta)).unwrap();
        assert!(report.applied);

        let game = r.current_game().unwrap();
        assert_eq!(game.item(0).unwrap().text, "Dog barks");
        assert_eq!(game.item(1).unwrap().text, "Red car");
        assert!(game.item(0).unwrap().is_marked_by("alice"));
        assert_eq!(game.last_modified_at, 150);
    }

    #[test_timeout::timeout]
    fn full_frame_with_blank_text_does_not_erase_it() {
        let mut r = reconciler(Arc::new(ManualClock::new(1_000)));
        r.apply(full(session(1, 100))).unwrap();
        let mut blank = session(2, 200);
        blank.items[0].text.clear();
        r.apply(full(blank)).unwrap();
        assert_eq!(r.current_game().unwrap().item(0).unwrap().text, "Dog barks");
    }

    #[test_timeout::timeout]
    fn stale_frames_are_ignored() {
        let mut r = reconciler(Arc::new(ManualClock::new(1_000)));
        r.apply(full(session(5, 500))).unwrap();
        let mut old = session(4, 400);
        old.title = "Old".into();
        let report = r.apply(full(old)).unwrap();
        assert!(!report.applied);
        assert_eq!(r.current_game().unwrap().title, "Road trip");
        assert_eq!(r.current_game().unwrap().last_modified_at, 500);
    }

    #[test_timeout::timeout]
    fn merge_keeps_admin_token_presence_and_own_marks() {
        let clock = Arc::new(ManualClock::new(100_000));
        let mut r = reconciler(clock.clone());
        let mut doc = session(1, 100);
        doc.players = vec![Player::new("carol", "Carol", 1_000), Player::new("dave", "Dave", 99_000)];
        r.apply(full(doc.clone())).unwrap();
        mark(&mut r, 2);

        // Server has not seen the mark yet and reports stale presence.
        doc.version = 2;
        doc.players[1].is_online = false;
        r.apply(full(doc)).unwrap();

        let game = r.current_game().unwrap();
        assert_eq!(game.admin_secret.as_deref(), Some("admin-token"));
        assert!(game.item(2).unwrap().is_marked_by("carol"));
        assert!(game.player("carol").unwrap().is_online);
        assert!(game.player("dave").unwrap().is_online);
        assert_eq!(r.online_count(), 2);
        assert!(r.last_server_state().unwrap().admin_secret.is_none());
    }

    #[test_timeout::timeout]
    fn near_miss_is_reported_when_someone_else_wins_just_before() {
        let clock = Arc::new(ManualClock::new(10_000));
        let mut r = reconciler(clock.clone());
        r.apply(full(session(1, 100))).unwrap();
        mark(&mut r, 0);
        mark(&mut r, 1);
        clock.set(12_000);
        mark(&mut r, 2);
        assert_eq!(r.completed_at(), Some(12_000));

        let mut won = session(2, 10_500);
        won.winner = Some(winner("alice", 10_000));
        let report = r.apply(full(won)).unwrap();

        let miss = report.near_miss.unwrap();
        assert_eq!(miss.time_difference_ms, 2_000);
        assert!(miss.time_difference_ms.abs() < NEAR_MISS_WINDOW_MS);
        assert_eq!(r.near_miss().unwrap().winner_id, "alice");
        assert_eq!(report.winner_confirmed.unwrap().player_id, "alice");

        // Seeing the same winner again is not a new transition.
        let report = r.apply(full(session(3, 11_000))).unwrap();
        assert!(report.winner_confirmed.is_none());
        assert_eq!(r.current_game().unwrap().winner.as_ref().unwrap().player_id, "alice");
    }

    #[test_timeout::timeout]
    fn completing_after_a_known_winner_still_measures_the_gap() {
        let clock = Arc::new(ManualClock::new(10_000));
        let mut r = reconciler(clock.clone());
        let mut won = session(1, 100);
        won.winner = Some(winner("alice", 10_000));
        r.apply(full(won)).unwrap();
        mark(&mut r, 0);
        mark(&mut r, 1);
        assert!(r.near_miss().is_none());

        clock.set(12_000);
        mark(&mut r, 2);
        assert_eq!(r.completed_at(), Some(12_000));
        let miss = r.near_miss().unwrap();
        assert_eq!(miss.winner_id, "alice");
        assert_eq!(miss.time_difference_ms, 2_000);

        // Later frames keep the verdict.
        r.apply(full(session(2, 200))).unwrap();
        assert_eq!(r.near_miss().unwrap().time_difference_ms, 2_000);
    }

    #[test_timeout::timeout]
    fn completing_long_after_the_win_is_not_a_near_miss() {
        let clock = Arc::new(ManualClock::new(10_000));
        let mut r = reconciler(clock.clone());
        let mut won = session(1, 100);
        won.winner = Some(winner("alice", 1_000));
        r.apply(full(won)).unwrap();
        for position in 0..3 {
            mark(&mut r, position);
        }
        assert_eq!(r.completed_at(), Some(10_000));
        assert!(r.near_miss().is_none());
    }

    #[test_timeout::timeout]
    fn foreign_winner_rolls_back_optimistic_win() {
        let clock = Arc::new(ManualClock::new(10_000));
        let mut r = reconciler(clock.clone());
        r.apply(full(session(1, 100))).unwrap();
        for position in 0..3 {
            mark(&mut r, position);
        }
        let _pending = r
            .apply_local(LocalCommand::ClaimWin {
                win_type: WinType::FullCard,
                winning_positions: vec![0, 1, 2],
            })
            .unwrap();
        assert!(r.player_state().has_won);
        assert_eq!(r.current_game().unwrap().winner.as_ref().unwrap().player_id, "carol");

        let mut won = session(2, 200);
        won.winner = Some(winner("alice", 9_000));
        let report = r.apply(full(won)).unwrap();
        assert!(report.rolled_back_win);
        assert!(!r.player_state().has_won);
        assert_eq!(r.current_game().unwrap().winner.as_ref().unwrap().player_id, "alice");
        assert_eq!(report.near_miss.unwrap().time_difference_ms, 1_000);
    }

    #[test_timeout::timeout]
    fn rollback_restores_only_what_the_command_touched() {
        let clock = Arc::new(ManualClock::new(1_000));
        let mut r = reconciler(clock);
        r.apply(full(session(1, 100))).unwrap();

        let tentative = r
            .apply_local(LocalCommand::SetMark {
                position: 1,
                marked: true,
            })
            .unwrap();
        let mut renamed = session(2, 200);
        renamed.title = "Renamed".into();
        r.apply(full(renamed)).unwrap();
        assert!(r.current_game().unwrap().item(1).unwrap().is_marked_by("carol"));

        r.rollback(tentative);
        let game = r.current_game().unwrap();
        assert!(!game.item(1).unwrap().is_marked_by("carol"));
        assert_eq!(game.title, "Renamed");

        assert_eq!(
            r.apply_local(LocalCommand::SetMark {
                position: 9,
                marked: true
            }),
            Err(ReconcileError::UnknownPosition(9))
        );
    }

    #[test_timeout::timeout]
    fn frames_for_other_sessions_are_refused() {
        let mut r = reconciler(Arc::new(ManualClock::new(0)));
        let mut other = session(1, 1);
        other.code = "ZZZ999".into();
        assert!(matches!(
            r.apply(full(other)),
            Err(ReconcileError::CodeMismatch { .. })
        ));
        assert_eq!(
            r.apply(SyncEnvelope::Delta(SessionDelta::default())),
            Err(ReconcileError::NoSession)
        );
    }
}
