use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on distinct players tracked per session. Also bounds every
/// item's `marked_by` list, since a player holds at most one mark per item.
pub const MAX_PLAYERS: usize = 64;

const DEFAULT_GRID_SIZE: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("duplicate item position {0}")]
    DuplicatePosition(u32),
    #[error("player {player_id} holds more than one mark on position {position}")]
    DuplicateMark { position: u32, player_id: String },
    #[error("no item at position {0}")]
    UnknownPosition(u32),
    #[error("session is full")]
    TooManyPlayers,
    #[error("code mismatch: expected {expected}, found {found}")]
    CodeMismatch { expected: String, found: String },
    #[error("player mismatch: expected {expected}, found {found}")]
    PlayerMismatch { expected: String, found: String },
    #[error("grid size must be at least 1, got {0}")]
    InvalidGridSize(u32),
    #[error("line wins need a {grid_size}x{grid_size} card, found {items} items")]
    GridMismatch { grid_size: u32, items: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mark {
    pub player_id: String,
    pub display_name: String,
    pub marked_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    #[serde(default)]
    pub text: String,
    pub position: u32,
    #[serde(default)]
    pub marked_by: Vec<Mark>,
}

impl Item {
    pub fn new(id: impl Into<String>, text: impl Into<String>, position: u32) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            position,
            marked_by: Vec::new(),
        }
    }

    pub fn is_marked_by(&self, player_id: &str) -> bool {
        self.marked_by.iter().any(|m| m.player_id == player_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_grid_size")]
    pub grid_size: u32,
    #[serde(default = "default_true")]
    pub require_full_completion: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            grid_size: DEFAULT_GRID_SIZE,
            require_full_completion: true,
        }
    }
}

impl Settings {
    /// Line wins only make sense on a square card; full-card sessions accept any
    /// item count.
    pub fn validate(&self, item_count: usize) -> Result<(), ValidationError> {
        if self.grid_size == 0 {
            return Err(ValidationError::InvalidGridSize(self.grid_size));
        }
        if !self.require_full_completion && !self.is_square(item_count) {
            return Err(ValidationError::GridMismatch {
                grid_size: self.grid_size,
                items: item_count,
            });
        }
        Ok(())
    }

    pub fn is_square(&self, item_count: usize) -> bool {
        let side = self.grid_size as usize;
        side > 0 && side.checked_mul(side) == Some(item_count)
    }
}

fn default_grid_size() -> u32 {
    DEFAULT_GRID_SIZE
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: String,
    pub display_name: String,
    pub joined_at: i64,
    pub last_seen_at: i64,
    #[serde(default)]
    pub has_won: bool,
    /// Derived from `last_seen_at` by whoever renders the document; never trusted from the wire.
    #[serde(default)]
    pub is_online: bool,
}

impl Player {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, now_ms: i64) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            joined_at: now_ms,
            last_seen_at: now_ms,
            has_won: false,
            is_online: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WinType {
    FullCard,
    Line,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WinnerInfo {
    pub player_id: String,
    pub display_name: String,
    pub won_at: i64,
    pub win_type: WinType,
    pub winning_positions: Vec<u32>,
}

/// The shared game document, keyed by its public join code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    /// Creator capability. Server-side this holds the SHA-256 hex digest of the token;
    /// the creator's client holds the plain token. Stripped before any fan-out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_secret: Option<String>,
    pub code: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub items: Vec<Item>,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub players: Vec<Player>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<WinnerInfo>,
    pub created_at: i64,
    pub last_modified_at: i64,
    /// Write stamp. Bumped by the server on every accepted write.
    #[serde(default)]
    pub version: u64,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        code: impl Into<String>,
        title: impl Into<String>,
        items: Vec<Item>,
        settings: Settings,
        now_ms: i64,
    ) -> Self {
        Self {
            id: id.into(),
            admin_secret: None,
            code: code.into(),
            title: title.into(),
            items,
            settings,
            players: Vec::new(),
            winner: None,
            created_at: now_ms,
            last_modified_at: now_ms,
            version: 0,
        }
    }

    /// Structural checks applied before anything is persisted.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::MissingField("id"));
        }
        if self.code.trim().is_empty() {
            return Err(ValidationError::MissingField("code"));
        }
        let mut positions = HashSet::new();
        for item in &self.items {
            if item.id.trim().is_empty() {
                return Err(ValidationError::MissingField("items[].id"));
            }
            if !positions.insert(item.position) {
                return Err(ValidationError::DuplicatePosition(item.position));
            }
            let mut markers = HashSet::new();
            for mark in &item.marked_by {
                if mark.player_id.trim().is_empty() {
                    return Err(ValidationError::MissingField("markedBy[].playerId"));
                }
                if !markers.insert(mark.player_id.as_str()) {
                    return Err(ValidationError::DuplicateMark {
                        position: item.position,
                        player_id: mark.player_id.clone(),
                    });
                }
            }
        }
        for player in &self.players {
            if player.id.trim().is_empty() {
                return Err(ValidationError::MissingField("players[].id"));
            }
        }
        if self.players.len() > MAX_PLAYERS {
            return Err(ValidationError::TooManyPlayers);
        }
        self.settings.validate(self.items.len())
    }

    pub fn item(&self, position: u32) -> Option<&Item> {
        self.items.iter().find(|item| item.position == position)
    }

    pub fn item_mut(&mut self, position: u32) -> Option<&mut Item> {
        self.items.iter_mut().find(|item| item.position == position)
    }

    pub fn player(&self, player_id: &str) -> Option<&Player> {
        self.players.iter().find(|p| p.id == player_id)
    }

    pub fn player_mut(&mut self, player_id: &str) -> Option<&mut Player> {
        self.players.iter_mut().find(|p| p.id == player_id)
    }

    /// Adds the player if unknown, otherwise refreshes its name and last-seen time.
    /// Returns `true` when the player is new.
    pub fn upsert_player(
        &mut self,
        player_id: &str,
        display_name: &str,
        now_ms: i64,
    ) -> Result<bool, ValidationError> {
        if player_id.trim().is_empty() {
            return Err(ValidationError::MissingField("playerId"));
        }
        if let Some(player) = self.player_mut(player_id) {
            if !display_name.trim().is_empty() {
                player.display_name = display_name.to_string();
            }
            player.last_seen_at = player.last_seen_at.max(now_ms);
            return Ok(false);
        }
        if display_name.trim().is_empty() {
            return Err(ValidationError::MissingField("displayName"));
        }
        if self.players.len() >= MAX_PLAYERS {
            return Err(ValidationError::TooManyPlayers);
        }
        self.players.push(Player::new(player_id, display_name, now_ms));
        Ok(true)
    }

    /// Records a heartbeat. Returns `false` for unknown players.
    pub fn touch_player(&mut self, player_id: &str, now_ms: i64) -> bool {
        match self.player_mut(player_id) {
            Some(player) => {
                player.last_seen_at = player.last_seen_at.max(now_ms);
                true
            }
            None => false,
        }
    }

    /// Places the player's mark on an item. Marking twice is a no-op, which keeps
    /// `marked_by` bounded by the player count. Returns `true` if the mark was added.
    pub fn mark(
        &mut self,
        position: u32,
        player_id: &str,
        display_name: &str,
        now_ms: i64,
    ) -> Result<bool, ValidationError> {
        let item = self
            .item_mut(position)
            .ok_or(ValidationError::UnknownPosition(position))?;
        if item.is_marked_by(player_id) {
            return Ok(false);
        }
        item.marked_by.push(Mark {
            player_id: player_id.to_string(),
            display_name: display_name.to_string(),
            marked_at: now_ms,
        });
        Ok(true)
    }

    /// Removes the player's mark. Returns `true` if a mark was removed.
    pub fn unmark(&mut self, position: u32, player_id: &str) -> Result<bool, ValidationError> {
        let item = self
            .item_mut(position)
            .ok_or(ValidationError::UnknownPosition(position))?;
        let before = item.marked_by.len();
        item.marked_by.retain(|m| m.player_id != player_id);
        Ok(item.marked_by.len() != before)
    }

    /// Positions the player currently holds a mark on, in item order.
    pub fn positions_marked_by(&self, player_id: &str) -> Vec<u32> {
        self.items
            .iter()
            .filter(|item| item.is_marked_by(player_id))
            .map(|item| item.position)
            .collect()
    }

    /// `true` when `positions` covers every item on the card.
    pub fn is_complete(&self, positions: &[u32]) -> bool {
        if self.items.is_empty() {
            return false;
        }
        let marked: HashSet<u32> = positions.iter().copied().collect();
        self.items.iter().all(|item| marked.contains(&item.position))
    }

    /// `true` when `positions` is exactly one full row, column or diagonal of a
    /// square card.
    pub fn is_line(&self, positions: &[u32]) -> bool {
        if !self.settings.is_square(self.items.len()) {
            return false;
        }
        let side = self.settings.grid_size;
        let claimed: HashSet<u32> = positions.iter().copied().collect();
        if claimed.len() != positions.len() || claimed.len() != side as usize {
            return false;
        }
        let rows = (0..side).map(|r| (0..side).map(|c| r * side + c).collect::<HashSet<_>>());
        let cols = (0..side).map(|c| (0..side).map(|r| r * side + c).collect::<HashSet<_>>());
        let diagonals = [
            (0..side).map(|i| i * side + i).collect::<HashSet<_>>(),
            (0..side).map(|i| i * side + (side - 1 - i)).collect::<HashSet<_>>(),
        ];
        rows.chain(cols)
            .chain(diagonals)
            .any(|line| line == claimed)
    }

    /// Copy safe to hand to any viewer.
    pub fn redacted(&self) -> Session {
        let mut copy = self.clone();
        copy.admin_secret = None;
        copy
    }

    pub fn touch(&mut self, now_ms: i64) {
        self.last_modified_at = self.last_modified_at.max(now_ms);
    }
}

/// A client's own record of its progress in one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    pub code: String,
    pub player_id: String,
    pub display_name: String,
    #[serde(default)]
    pub marked_positions: Vec<u32>,
    #[serde(default)]
    pub last_sync_at: i64,
    #[serde(default)]
    pub has_won: bool,
}

impl PlayerState {
    pub fn new(
        code: impl Into<String>,
        player_id: impl Into<String>,
        display_name: impl Into<String>,
        now_ms: i64,
    ) -> Self {
        Self {
            code: code.into(),
            player_id: player_id.into(),
            display_name: display_name.into(),
            marked_positions: Vec::new(),
            last_sync_at: now_ms,
            has_won: false,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.code.trim().is_empty() {
            return Err(ValidationError::MissingField("code"));
        }
        if self.player_id.trim().is_empty() {
            return Err(ValidationError::MissingField("playerId"));
        }
        if self.display_name.trim().is_empty() {
            return Err(ValidationError::MissingField("displayName"));
        }
        Ok(())
    }

    pub fn has_marked(&self, position: u32) -> bool {
        self.marked_positions.contains(&position)
    }

    /// Sets or clears a position. Returns `true` if the record changed.
    pub fn set_marked(&mut self, position: u32, marked: bool) -> bool {
        match (marked, self.has_marked(position)) {
            (true, false) => {
                self.marked_positions.push(position);
                self.marked_positions.sort_unstable();
                true
            }
            (false, true) => {
                self.marked_positions.retain(|p| *p != position);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_item_session() -> Session {
        Session::new(
            "s-1",
            "ABC123",
            "Road trip",
            vec![
                Item::new("i-0", "Dog barks", 0),
                Item::new("i-1", "Red car", 1),
                Item::new("i-2", "Bridge", 2),
            ],
            Settings::default(),
            1_000,
        )
    }

    #[test_timeout::timeout]
    fn marks_are_set_semantics() {
        let mut session = three_item_session();
        assert!(session.mark(0, "alice", "Alice", 1_100).unwrap());
        assert!(!session.mark(0, "alice", "Alice", 1_200).unwrap());
        assert_eq!(session.item(0).unwrap().marked_by.len(), 1);
        assert_eq!(session.item(0).unwrap().marked_by[0].marked_at, 1_100);

        assert!(session.unmark(0, "alice").unwrap());
        assert!(!session.unmark(0, "alice").unwrap());
        assert_eq!(
            session.mark(9, "alice", "Alice", 1_300),
            Err(ValidationError::UnknownPosition(9))
        );
    }

    #[test_timeout::timeout]
    fn validate_rejects_structural_problems() {
        let mut session = three_item_session();
        assert!(session.validate().is_ok());

        session.items[1].position = 0;
        assert_eq!(
            session.validate(),
            Err(ValidationError::DuplicatePosition(0))
        );

        let mut session = three_item_session();
        let mark = Mark {
            player_id: "bob".into(),
            display_name: "Bob".into(),
            marked_at: 1,
        };
        session.items[2].marked_by = vec![mark.clone(), mark];
        assert!(matches!(
            session.validate(),
            Err(ValidationError::DuplicateMark { position: 2, .. })
        ));

        let mut session = three_item_session();
        session.code = "  ".into();
        assert_eq!(session.validate(), Err(ValidationError::MissingField("code")));
    }

    #[test_timeout::timeout]
    fn completion_requires_every_position() {
        let session = three_item_session();
        assert!(!session.is_complete(&[0, 1]));
        assert!(!session.is_complete(&[0, 1, 1]));
        assert!(session.is_complete(&[2, 0, 1]));
    }

    #[test_timeout::timeout]
    fn upsert_player_caps_roster() {
        let mut session = three_item_session();
        for idx in 0..MAX_PLAYERS {
            assert!(session
                .upsert_player(&format!("p-{idx}"), "P", 1_000)
                .unwrap());
        }
        assert!(!session.upsert_player("p-0", "Renamed", 2_000).unwrap());
        assert_eq!(session.player("p-0").unwrap().display_name, "Renamed");
        assert_eq!(session.player("p-0").unwrap().last_seen_at, 2_000);
        assert_eq!(
            session.upsert_player("late", "Late", 3_000),
            Err(ValidationError::TooManyPlayers)
        );
    }

    #[test_timeout::timeout]
    fn new_players_need_a_display_name() {
        let mut session = three_item_session();
        assert_eq!(
            session.upsert_player("ghost", "  ", 1_000),
            Err(ValidationError::MissingField("displayName"))
        );
        assert!(session.players.is_empty());

        assert!(session.upsert_player("alice", "Alice", 1_000).unwrap());
        assert!(!session.upsert_player("alice", "", 2_000).unwrap());
        assert_eq!(session.player("alice").unwrap().display_name, "Alice");
    }

    #[test_timeout::timeout]
    fn settings_reject_unusable_grids() {
        let mut session = three_item_session();
        session.settings.grid_size = 0;
        assert_eq!(session.validate(), Err(ValidationError::InvalidGridSize(0)));

        // Full-card sessions do not care about the grid shape.
        session.settings.grid_size = 5;
        assert!(session.validate().is_ok());

        session.settings.require_full_completion = false;
        assert_eq!(
            session.validate(),
            Err(ValidationError::GridMismatch {
                grid_size: 5,
                items: 3
            })
        );
    }

    #[test_timeout::timeout]
    fn lines_follow_the_grid() {
        let items = (0..9)
            .map(|idx| Item::new(format!("i-{idx}"), format!("Item {idx}"), idx))
            .collect();
        let session = Session::new(
            "s-1",
            "ABC123",
            "Road trip",
            items,
            Settings {
                grid_size: 3,
                require_full_completion: false,
            },
            1_000,
        );
        assert!(session.validate().is_ok());
        for line in [
            [0, 1, 2],
            [6, 7, 8],
            [2, 5, 8],
            [0, 4, 8],
            [6, 4, 2],
        ] {
            assert!(session.is_line(&line), "{line:?} is a line");
        }
        assert!(!session.is_line(&[0, 1, 5]));
        assert!(!session.is_line(&[0, 1]));
        assert!(!session.is_line(&[0, 0, 0]));
        assert!(!three_item_session().is_line(&[0, 1, 2]));
    }

    #[test_timeout::timeout]
    fn redacted_copy_drops_admin_secret() {
        let mut session = three_item_session();
        session.admin_secret = Some("digest".into());
        let json = serde_json::to_value(session.redacted()).unwrap();
        assert!(json.get("adminSecret").is_none());
        assert_eq!(json["code"], "ABC123");
        assert_eq!(json["settings"]["requireFullCompletion"], true);
    }

    #[test_timeout::timeout]
    fn player_state_toggles_sorted_positions() {
        let mut state = PlayerState::new("ABC123", "alice", "Alice", 0);
        assert!(state.set_marked(2, true));
        assert!(state.set_marked(0, true));
        assert!(!state.set_marked(0, true));
        assert_eq!(state.marked_positions, vec![0, 2]);
        assert!(state.set_marked(2, false));
        assert_eq!(state.marked_positions, vec![0]);

        state.display_name = String::new();
        assert_eq!(
            state.validate(),
            Err(ValidationError::MissingField("displayName"))
        );
    }
}
