//! Frames pushed to stream viewers.
//!
//! Every data frame is a [`StreamFrame`]: either a [`SyncEnvelope`] tagged with
//! `kind` so receivers never have to sniff fields to tell a replacement from a
//! patch, or the `{"error":"not found"}` terminal frame.

use serde::{Deserialize, Serialize};

use crate::model::{Item, Mark, Player, Session, WinnerInfo};

pub const NOT_FOUND: &str = "not found";

/// Full document as seen by one viewer, with presence already derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    #[serde(flatten)]
    pub session: Session,
    pub online_count: usize,
}

/// Changed fields only. Absent fields mean "unchanged", never "cleared".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<ItemPatch>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub players: Option<Vec<Player>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<WinnerInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online_count: Option<usize>,
}

impl SessionDelta {
    /// Patch carrying only the player roster, used for heartbeat fan-out.
    pub fn presence(session: &Session, online_count: usize) -> Self {
        Self {
            players: Some(session.players.clone()),
            last_modified_at: Some(session.last_modified_at),
            version: Some(session.version),
            online_count: Some(online_count),
            ..Self::default()
        }
    }
}

/// Item change keyed by `position`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemPatch {
    pub position: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marked_by: Option<Vec<Mark>>,
}

impl From<&Item> for ItemPatch {
    fn from(item: &Item) -> Self {
        Self {
            position: item.position,
            id: Some(item.id.clone()),
            text: Some(item.text.clone()),
            marked_by: Some(item.marked_by.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "lowercase")]
pub enum SyncEnvelope {
    Full(SessionSnapshot),
    Delta(SessionDelta),
}

impl SyncEnvelope {
    pub fn last_modified_at(&self) -> Option<i64> {
        match self {
            SyncEnvelope::Full(snapshot) => Some(snapshot.session.last_modified_at),
            SyncEnvelope::Delta(delta) => delta.last_modified_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamFrame {
    Sync(SyncEnvelope),
    Error { error: String },
}

impl StreamFrame {
    pub fn not_found() -> Self {
        StreamFrame::Error {
            error: NOT_FOUND.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StreamFrame::Error { error } if error == NOT_FOUND)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Settings;

    #[test_timeout::timeout]
    fn not_found_frame_matches_wire_contract() {
        let frame = StreamFrame::not_found();
        assert_eq!(frame.to_json(), r#"{"error":"not found"}"#);
        let parsed: StreamFrame = serde_json::from_str(r#"{"error":"not found"}"#).unwrap();
        assert!(parsed.is_not_found());
    }

    #[test_timeout::timeout]
    fn full_frame_flattens_session_and_carries_online_count() {
        let session = Session::new(
            "s",
            "CODE01",
            "Title",
            vec![Item::new("i", "Dog barks", 0)],
            Settings::default(),
            7,
        );
        let frame = StreamFrame::Sync(SyncEnvelope::Full(SessionSnapshot {
            session,
            online_count: 3,
        }));
        let value: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(value["kind"], "full");
        assert_eq!(value["payload"]["code"], "CODE01");
        assert_eq!(value["payload"]["onlineCount"], 3);
        assert_eq!(value["payload"]["items"][0]["text"], "Dog barks");

        let back: StreamFrame = serde_json::from_value(value).unwrap();
        match back {
            StreamFrame::Sync(SyncEnvelope::Full(snapshot)) => {
                assert_eq!(snapshot.online_count, 3);
                assert_eq!(snapshot.session.last_modified_at, 7);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn delta_frame_omits_untouched_fields() {
        let frame: StreamFrame =
            serde_json::from_str(r#"{"kind":"delta","payload":{"items":[{"position":0}]}}"#)
                .unwrap();
        match frame {
            StreamFrame::Sync(SyncEnvelope::Delta(delta)) => {
                let items = delta.items.unwrap();
                assert_eq!(items[0].position, 0);
                assert!(items[0].text.is_none());
                assert!(delta.players.is_none());
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
