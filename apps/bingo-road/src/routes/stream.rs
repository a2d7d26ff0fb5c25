use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use bingo_core::{ChangeKind, SessionDelta, SessionSnapshot, StreamFrame, SyncEnvelope};
use futures::stream::{self, Stream};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::codes::normalize_code;
use crate::notifier::Subscription;
use crate::sessions::SessionService;
use crate::state::AppState;

use super::ViewerQuery;

/// One viewer's stream. Owns the subscription, so dropping the response body is
/// what unsubscribes.
struct Viewer {
    sessions: SessionService,
    subscription: Subscription,
    player_id: Option<String>,
    sent_initial: bool,
    finished: bool,
}

pub async fn stream_session(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Query(query): Query<ViewerQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let code = normalize_code(&code);
    // Subscribe before the first read so no change between the two is missed.
    let subscription = state.sessions.notifier().subscribe(&code);
    let viewer = Viewer {
        sessions: state.sessions.clone(),
        subscription,
        player_id: query.player_id,
        sent_initial: false,
        finished: false,
    };

    let frames = stream::unfold(viewer, |mut viewer| async move {
        let frame = viewer.next_frame().await?;
        Some((Ok(Event::default().data(frame.to_json())), viewer))
    });
    Sse::new(frames).keep_alive(KeepAlive::new().interval(state.stream_keepalive))
}

impl Viewer {
    async fn next_frame(&mut self) -> Option<StreamFrame> {
        if self.finished {
            return None;
        }
        loop {
            let kind = if self.sent_initial {
                match self.subscription.recv().await {
                    Ok(notice) => Some(notice.kind),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(session = %self.subscription.code(), skipped, "viewer lagged; sending full frame");
                        None
                    }
                    Err(RecvError::Closed) => return None,
                }
            } else {
                self.sent_initial = true;
                None
            };

            let code = self.subscription.code().to_string();
            match self.sessions.snapshot(&code, self.player_id.as_deref()).await {
                Ok(Some(snapshot)) => return Some(frame_for(kind, snapshot)),
                Ok(None) => {
                    debug!(session = %code, "session gone; closing stream");
                    self.finished = true;
                    return Some(StreamFrame::not_found());
                }
                Err(err) => {
                    // Wait for the next notice rather than tearing the stream down.
                    warn!(session = %code, error = %err, "failed to read session for stream");
                }
            }
        }
    }
}

/// Heartbeats only move presence, so they go out as a roster delta; anything else
/// replaces the viewer's copy.
fn frame_for(kind: Option<ChangeKind>, snapshot: SessionSnapshot) -> StreamFrame {
    let envelope = match kind {
        Some(ChangeKind::Presence) => SyncEnvelope::Delta(SessionDelta::presence(
            &snapshot.session,
            snapshot.online_count,
        )),
        _ => SyncEnvelope::Full(snapshot),
    };
    StreamFrame::Sync(envelope)
}
