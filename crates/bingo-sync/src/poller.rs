//! Polling fallback for viewers without a working stream.
//!
//! Polls start at 500 ms and slow down while the document stays unchanged
//! (1 s after 3 quiet polls, 2 s after 6, 3 s after 10). Any observed change or
//! local action puts the cadence back at the baseline.

use std::sync::Arc;
use std::time::Duration;

use bingo_core::{SessionSnapshot, SyncEnvelope};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::api::{SessionApi, SyncError};

pub const BASELINE_INTERVAL: Duration = Duration::from_millis(500);

const TIERS: [(u32, Duration); 3] = [
    (10, Duration::from_secs(3)),
    (6, Duration::from_secs(2)),
    (3, Duration::from_secs(1)),
];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollBackoff {
    unchanged: u32,
}

impl PollBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interval(&self) -> Duration {
        TIERS
            .iter()
            .find(|(streak, _)| self.unchanged >= *streak)
            .map(|(_, interval)| *interval)
            .unwrap_or(BASELINE_INTERVAL)
    }

    /// Records one poll and returns the delay before the next.
    pub fn observe(&mut self, changed: bool) -> Duration {
        if changed {
            self.unchanged = 0;
        } else {
            self.unchanged = self.unchanged.saturating_add(1);
        }
        self.interval()
    }

    pub fn reset(&mut self) {
        self.unchanged = 0;
    }

    pub fn unchanged_streak(&self) -> u32 {
        self.unchanged
    }
}

/// Running poll loop. Dropping the handle stops it.
pub struct PollHandle {
    nudge: Arc<Notify>,
    task: JoinHandle<()>,
}

impl PollHandle {
    /// Starts polling `code`, forwarding every changed document as a full envelope.
    pub fn spawn(
        api: Arc<dyn SessionApi>,
        code: impl Into<String>,
        viewer: Option<String>,
        frames: mpsc::Sender<SyncEnvelope>,
    ) -> Self {
        let nudge = Arc::new(Notify::new());
        let task = tokio::spawn(poll_loop(api, code.into(), viewer, frames, nudge.clone()));
        Self { nudge, task }
    }

    /// Local action happened: poll now and return to the baseline cadence.
    pub fn poke(&self) {
        self.nudge.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn stamp(snapshot: &SessionSnapshot) -> (u64, i64) {
    (snapshot.session.version, snapshot.session.last_modified_at)
}

async fn poll_loop(
    api: Arc<dyn SessionApi>,
    code: String,
    viewer: Option<String>,
    frames: mpsc::Sender<SyncEnvelope>,
    nudge: Arc<Notify>,
) {
    let mut backoff = PollBackoff::new();
    let mut last_seen = None;
    loop {
        let changed = match api.fetch_session(&code, viewer.as_deref()).await {
            Ok(snapshot) => {
                let current = stamp(&snapshot);
                let changed = last_seen != Some(current);
                if changed {
                    last_seen = Some(current);
                    if frames.send(SyncEnvelope::Full(snapshot)).await.is_err() {
                        return;
                    }
                }
                changed
            }
            Err(SyncError::NotFound) => {
                warn!(session = %code, "session not found; polling stopped");
                return;
            }
            Err(err) => {
                debug!(session = %code, error = %err, "poll failed");
                false
            }
        };

        let delay = backoff.observe(changed);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = nudge.notified() => backoff.reset(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::tests::FakeApi;

    #[test_timeout::timeout]
    fn cadence_slows_in_tiers_and_resets_on_change() {
        let mut backoff = PollBackoff::new();
        let delays: Vec<_> = (0..11).map(|_| backoff.observe(false)).collect();
        assert_eq!(delays[0], BASELINE_INTERVAL);
        assert_eq!(delays[1], BASELINE_INTERVAL);
        assert_eq!(delays[2], Duration::from_secs(1));
        assert_eq!(delays[4], Duration::from_secs(1));
        assert_eq!(delays[5], Duration::from_secs(2));
        assert_eq!(delays[8], Duration::from_secs(2));
        assert_eq!(delays[9], Duration::from_secs(3));
        assert_eq!(delays[10], Duration::from_secs(3));

        assert_eq!(backoff.observe(true), BASELINE_INTERVAL);
        assert_eq!(backoff.unchanged_streak(), 0);

        backoff.observe(false);
        backoff.observe(false);
        backoff.observe(false);
        backoff.reset();
        assert_eq!(backoff.interval(), BASELINE_INTERVAL);
    }

    #[test_timeout::tokio_timeout_test]
    async fn forwards_only_changed_documents() {
        tokio::time::pause();
        let api = Arc::new(FakeApi::new(&["A", "B"]));
        let (tx, mut rx) = mpsc::channel(8);
        let poller = PollHandle::spawn(api.clone(), "ABC123", Some("alice".into()), tx);

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, SyncEnvelope::Full(_)));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());

        api.bump_title("Renamed");
        poller.poke();
        match rx.recv().await.unwrap() {
            SyncEnvelope::Full(snapshot) => assert_eq!(snapshot.session.title, "Renamed"),
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn stops_when_the_session_is_gone() {
        let api = Arc::new(FakeApi::new(&["A"]));
        api.delete();
        let (tx, mut rx) = mpsc::channel(8);
        let poller = PollHandle::spawn(api, "ABC123", None, tx);
        assert!(rx.recv().await.is_none());
        for _ in 0..100 {
            if poller.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(poller.is_finished());
    }
}
