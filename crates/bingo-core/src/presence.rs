//! Online/offline derivation. Presence is never pushed; it is recomputed from
//! `last_seen_at` by whoever is about to show the player list.

use std::time::Duration;

use crate::model::Player;

/// A player is online while its last heartbeat is younger than this.
pub const ONLINE_THRESHOLD_MS: i64 = 15_000;

/// Cadence at which a foregrounded client reports itself.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

pub fn is_online(last_seen_at: i64, now_ms: i64) -> bool {
    now_ms - last_seen_at < ONLINE_THRESHOLD_MS
}

/// Rewrites `is_online` on every player as seen by `viewer` at `now_ms` and
/// returns the number of online players. The viewer always sees itself online.
pub fn refresh(players: &mut [Player], now_ms: i64, viewer: Option<&str>) -> usize {
    let mut online = 0;
    for player in players.iter_mut() {
        player.is_online =
            viewer == Some(player.id.as_str()) || is_online(player.last_seen_at, now_ms);
        if player.is_online {
            online += 1;
        }
    }
    online
}
