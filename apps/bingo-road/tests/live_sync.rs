//! Real listener, real HTTP and SSE, driven by the sync client.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bingo_core::{CreateSessionRequest, JoinRequest, SyncEnvelope, SystemClock};
use bingo_road::{build_router, AppState};
use bingo_sync::{
    ClaimOutcome, ConnectionStatus, GameSession, HttpEventTransport, HttpSessionApi, SessionApi,
    SyncManager,
};
use tokio::sync::mpsc;

async fn start_server() -> (String, AppState) {
    let mut state = AppState::in_memory(Arc::new(SystemClock));
    state.stream_keepalive = Duration::from_millis(200);
    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), state)
}

async fn create(api: &HttpSessionApi, items: &[&str]) -> String {
    api.create_session(&CreateSessionRequest {
        title: "Road trip".into(),
        items: items.iter().map(|item| item.to_string()).collect(),
        settings: None,
    })
    .await
    .unwrap()
    .code
}

async fn next_frame(frames: &mut mpsc::Receiver<SyncEnvelope>) -> SyncEnvelope {
    tokio::time::timeout(Duration::from_secs(5), frames.recv())
        .await
        .expect("no frame within 5s")
        .expect("stream closed")
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached within 5s");
}

#[test_timeout::tokio_timeout_test(30)]
async fn stream_pushes_changes_and_unsubscribes_on_disconnect() {
    let (base, state) = start_server().await;
    let api = Arc::new(HttpSessionApi::new(base.as_str()));
    let code = create(&api, &["Cow", "Dog", "Barn"]).await;

    let alice = GameSession::join(api.clone(), Arc::new(SystemClock), &code, "alice", "Alice", None)
        .await
        .unwrap();

    let mut manager = SyncManager::new(Arc::new(HttpEventTransport::new(base.as_str())));
    let status = manager.status();
    let mut frames = manager.connect(&code, Some("alice"));

    match next_frame(&mut frames).await {
        SyncEnvelope::Full(snapshot) => {
            assert_eq!(snapshot.session.code, code);
            assert_eq!(snapshot.session.players.len(), 1);
            assert!(snapshot.session.admin_secret.is_none());
        }
        other => panic!("expected a full frame first, got {other:?}"),
    }
    assert_eq!(*status.borrow(), ConnectionStatus::Connected);
    assert_eq!(state.sessions.notifier().subscriber_count(&code), 1);

    api.join(
        &code,
        &JoinRequest {
            player_id: "bob".into(),
            display_name: "Bob".into(),
        },
    )
    .await
    .unwrap();
    match next_frame(&mut frames).await {
        SyncEnvelope::Full(snapshot) => assert_eq!(snapshot.session.players.len(), 2),
        other => panic!("expected a full frame for the join, got {other:?}"),
    }

    api.heartbeat(&code, "bob").await.unwrap();
    match next_frame(&mut frames).await {
        SyncEnvelope::Delta(delta) => {
            assert!(delta.items.is_none());
            assert_eq!(delta.players.unwrap().len(), 2);
        }
        other => panic!("expected a presence delta, got {other:?}"),
    }

    alice.toggle_mark(1).await.unwrap();
    match next_frame(&mut frames).await {
        SyncEnvelope::Full(snapshot) => {
            assert!(snapshot.session.item(1).unwrap().is_marked_by("alice"));
            assert_eq!(snapshot.session.item(1).unwrap().text, "Dog");
        }
        other => panic!("expected a full frame for the mark, got {other:?}"),
    }

    drop(frames);
    manager.disconnect();
    eventually(|| {
        let state = state.clone();
        let code = code.clone();
        async move { state.sessions.notifier().subscriber_count(&code) == 0 }
    })
    .await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn racing_claims_converge_on_one_winner() {
    let (base, _state) = start_server().await;
    let api = Arc::new(HttpSessionApi::new(base.as_str()));
    let code = create(&api, &["A", "B", "C"]).await;

    let alice = GameSession::join(api.clone(), Arc::new(SystemClock), &code, "alice", "Alice", None)
        .await
        .unwrap();
    let bob = GameSession::join(api.clone(), Arc::new(SystemClock), &code, "bob", "Bob", None)
        .await
        .unwrap();

    let mut manager = SyncManager::new(Arc::new(HttpEventTransport::new(base.as_str())));
    let follower = bob.follow(manager.connect(&code, Some("bob")), manager.status());

    for position in 0..3 {
        alice.toggle_mark(position).await.unwrap();
        bob.toggle_mark(position).await.unwrap();
    }

    let (a, b) = tokio::join!(alice.claim_full_card(), bob.claim_full_card());
    let outcomes = [a.unwrap(), b.unwrap()];
    let confirmed: Vec<_> = outcomes
        .iter()
        .filter_map(|outcome| match outcome {
            ClaimOutcome::Confirmed(winner) => Some(winner.player_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(confirmed.len(), 1, "exactly one claim wins: {outcomes:?}");
    let winner = confirmed[0].clone();
    assert!(outcomes.iter().any(|outcome| matches!(
        outcome,
        ClaimOutcome::Rejected { winner: w, .. } if w.player_id == winner
    )));

    let server = api.fetch_session(&code, None).await.unwrap();
    assert_eq!(server.session.winner.unwrap().player_id, winner);

    for session in [&alice, &bob] {
        let expected = winner.clone();
        eventually(|| {
            let session = session.clone();
            let expected = expected.clone();
            async move {
                session
                    .current_game()
                    .await
                    .and_then(|game| game.winner)
                    .map(|w| w.player_id == expected)
                    .unwrap_or(false)
            }
        })
        .await;
    }
    let loser = if winner == "alice" { &bob } else { &alice };
    assert!(!loser.player_state().await.has_won);

    follower.abort();
    manager.disconnect();
}

#[test_timeout::tokio_timeout_test(30)]
async fn missing_session_ends_the_stream() {
    let (base, _state) = start_server().await;
    let mut manager = SyncManager::new(Arc::new(HttpEventTransport::new(base.as_str())));
    let mut status = manager.status();
    let mut frames = manager.connect("NOPE00", None);

    let closed = tokio::time::timeout(Duration::from_secs(5), frames.recv())
        .await
        .expect("stream did not close");
    assert!(closed.is_none());
    status
        .wait_for(|current| *current == ConnectionStatus::NotFound)
        .await
        .unwrap();
}

#[test_timeout::tokio_timeout_test(30)]
async fn reconnect_catches_up_with_missed_writes() {
    let (base, _state) = start_server().await;
    let api = Arc::new(HttpSessionApi::new(base.as_str()));
    let code = create(&api, &["A", "B"]).await;
    let alice = GameSession::join(api.clone(), Arc::new(SystemClock), &code, "alice", "Alice", None)
        .await
        .unwrap();

    let mut manager = SyncManager::new(Arc::new(HttpEventTransport::new(base.as_str())));
    let mut frames = manager.connect(&code, Some("alice"));
    let before = match next_frame(&mut frames).await {
        SyncEnvelope::Full(snapshot) => snapshot.session,
        other => panic!("expected a full frame first, got {other:?}"),
    };
    manager.disconnect();

    let bob = GameSession::join(api.clone(), Arc::new(SystemClock), &code, "bob", "Bob", None)
        .await
        .unwrap();
    bob.toggle_mark(0).await.unwrap();

    let mut frames = manager.connect(&code, Some("alice"));
    let after = match next_frame(&mut frames).await {
        SyncEnvelope::Full(snapshot) => snapshot.session,
        other => panic!("expected a full frame after reconnect, got {other:?}"),
    };
    assert!(after.version > before.version);
    assert!(after.last_modified_at >= before.last_modified_at);
    assert!(after.item(0).unwrap().is_marked_by("bob"));

    let report = alice.apply(SyncEnvelope::Full(bingo_core::SessionSnapshot {
        session: after,
        online_count: 2,
    }))
    .await
    .unwrap();
    assert!(report.applied);
    let stale = alice.apply(SyncEnvelope::Full(bingo_core::SessionSnapshot {
        session: before,
        online_count: 1,
    }))
    .await
    .unwrap();
    assert!(!stale.applied);
    assert!(alice.current_game().await.unwrap().item(0).unwrap().is_marked_by("bob"));
}

#[test_timeout::tokio_timeout_test(30)]
async fn idle_stream_sends_keepalive_comments() {
    let (base, _state) = start_server().await;
    let api = HttpSessionApi::new(base.as_str());
    let code = create(&api, &["A", "B"]).await;

    let mut response = api
        .client()
        .get(format!("{base}/sessions/{code}/events"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let content_type = response.headers()["content-type"].to_str().unwrap();
    assert!(content_type.starts_with("text/event-stream"), "{content_type}");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut wire = String::new();
    while !wire.contains("\n:") {
        let chunk = tokio::time::timeout_at(deadline, response.chunk())
            .await
            .expect("no keep-alive comment within 5s")
            .unwrap()
            .expect("stream closed");
        wire.push_str(&String::from_utf8_lossy(&chunk));
    }
    // The snapshot goes out first; the comment follows once the stream idles.
    assert!(wire.starts_with("data:"), "{wire}");
}

#[test_timeout::tokio_timeout_test(30)]
async fn joining_saves_a_player_record() {
    let (base, _state) = start_server().await;
    let api = Arc::new(HttpSessionApi::new(base.as_str()));
    let code = create(&api, &["A", "B"]).await;
    assert!(api.load_player_state(&code, "alice").await.unwrap().is_none());

    let alice = GameSession::join(api.clone(), Arc::new(SystemClock), &code, "alice", "Alice", None)
        .await
        .unwrap();
    let saved = api.load_player_state(&code, "alice").await.unwrap().unwrap();
    assert_eq!(saved.display_name, "Alice");
    assert!(saved.marked_positions.is_empty());

    alice.toggle_mark(1).await.unwrap();
    let saved = api.load_player_state(&code, "alice").await.unwrap().unwrap();
    assert_eq!(saved.marked_positions, vec![1]);
}
