use serde::{Deserialize, Serialize};

use crate::model::Session;

/// What a write did to a session. Stated by the mutating operation itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeKind {
    PlayerJoined,
    GameWon,
    ItemsChanged,
    /// Heartbeat only: the player list's `last_seen_at` moved, nothing else did.
    Presence,
    Update,
}

impl ChangeKind {
    /// Best-effort guess for writes that replace the whole document without saying
    /// what they changed. Operations that know their kind must not use this.
    pub fn classify(previous: Option<&Session>, next: &Session) -> Self {
        let Some(previous) = previous else {
            return ChangeKind::Update;
        };
        if next.players.len() > previous.players.len() {
            ChangeKind::PlayerJoined
        } else if next.winner.is_some() && previous.winner.is_none() {
            ChangeKind::GameWon
        } else if next.items.len() != previous.items.len() {
            ChangeKind::ItemsChanged
        } else {
            ChangeKind::Update
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::PlayerJoined => "player-joined",
            ChangeKind::GameWon => "game-won",
            ChangeKind::ItemsChanged => "items-changed",
            ChangeKind::Presence => "presence",
            ChangeKind::Update => "update",
        }
    }
}

/// Message published on `session:<code>`. Subscribers treat it as a wake-up only
/// and re-read the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotice {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub timestamp: i64,
}

impl ChangeNotice {
    pub fn new(kind: ChangeKind, timestamp: i64) -> Self {
        Self { kind, timestamp }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Item, Settings, WinType, WinnerInfo};

    fn base() -> Session {
        Session::new(
            "s",
            "CODE01",
            "t",
            vec![Item::new("a", "A", 0)],
            Settings::default(),
            0,
        )
    }

    #[test_timeout::timeout]
    fn classify_follows_precedence() {
        let prev = base();

        let mut joined = prev.clone();
        joined.upsert_player("p1", "P1", 1).unwrap();
        assert_eq!(ChangeKind::classify(Some(&prev), &joined), ChangeKind::PlayerJoined);

        let mut won = prev.clone();
        won.winner = Some(WinnerInfo {
            player_id: "p1".into(),
            display_name: "P1".into(),
            won_at: 5,
            win_type: WinType::FullCard,
            winning_positions: vec![0],
        });
        assert_eq!(ChangeKind::classify(Some(&prev), &won), ChangeKind::GameWon);

        let mut edited = prev.clone();
        edited.items.push(Item::new("b", "B", 1));
        assert_eq!(ChangeKind::classify(Some(&prev), &edited), ChangeKind::ItemsChanged);

        let mut retitled = prev.clone();
        retitled.title = "new".into();
        assert_eq!(ChangeKind::classify(Some(&prev), &retitled), ChangeKind::Update);
        assert_eq!(ChangeKind::classify(None, &retitled), ChangeKind::Update);
    }

    #[test_timeout::timeout]
    fn notice_wire_shape() {
        let notice = ChangeNotice::new(ChangeKind::GameWon, 42);
        let json = serde_json::to_string(&notice).unwrap();
        assert_eq!(json, r#"{"type":"game-won","timestamp":42}"#);
        let back: ChangeNotice = serde_json::from_str(&json).unwrap();
        assert_eq!(back, notice);
        assert_eq!(ChangeKind::ItemsChanged.as_str(), "items-changed");
    }
}
