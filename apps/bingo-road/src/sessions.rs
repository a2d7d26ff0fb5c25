//! Session mutations.
//!
//! Every write goes through [`SessionService::mutate`]: read the document, apply a
//! closure, bump `version`, and land it with a conditional write guarded on the
//! version that was read. A lost race re-reads and re-applies, so concurrent
//! writers never clobber each other, and the closure always sees the latest
//! document. The closure states the [`ChangeKind`] it produced, which is what gets
//! published.

use std::sync::Arc;

use bingo_core::{
    presence, ChangeKind, ChangeNotice, Clock, CreateSessionRequest, CreateSessionResponse, Item,
    JoinRequest, MarkRequest, PlayerState, Session, SessionSnapshot, ValidationError,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::codes::{
    generate_admin_secret, generate_item_id, generate_join_code, generate_session_id,
    hash_secret, verify_secret,
};
use crate::metrics;
use crate::notifier::ChangeNotifier;
use crate::storage::{StoreError, StoreHandle};

const MAX_WRITE_ATTEMPTS: usize = 8;
const MAX_CODE_ATTEMPTS: usize = 5;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("session not found")]
    SessionNotFound,
    #[error("player {0} is not part of this session")]
    PlayerNotFound(String),
    #[error("invalid payload: {0}")]
    Invalid(#[from] ValidationError),
    #[error("invalid claim: {0}")]
    InvalidClaim(String),
    #[error("admin secret required")]
    Forbidden,
    #[error("write conflict persisted after {MAX_WRITE_ATTEMPTS} attempts")]
    Conflict,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a mutation closure decided.
pub enum Outcome<T> {
    /// Persist the edited document and publish `ChangeKind`.
    Commit(ChangeKind, T),
    /// Leave the stored document as it is.
    Abort(T),
}

#[derive(Clone)]
pub struct SessionService {
    store: StoreHandle,
    notifier: ChangeNotifier,
    clock: Arc<dyn Clock>,
}

impl SessionService {
    pub fn new(store: StoreHandle, notifier: ChangeNotifier, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            notifier,
            clock,
        }
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub async fn get(&self, code: &str) -> Result<Option<Session>, ServiceError> {
        Ok(self.store.get_session(code).await?)
    }

    /// Redacted document with presence derived for `viewer`.
    pub async fn snapshot(
        &self,
        code: &str,
        viewer: Option<&str>,
    ) -> Result<Option<SessionSnapshot>, ServiceError> {
        let Some(session) = self.store.get_session(code).await? else {
            return Ok(None);
        };
        Ok(Some(self.view(&session, viewer)))
    }

    pub fn view(&self, session: &Session, viewer: Option<&str>) -> SessionSnapshot {
        let mut session = session.redacted();
        let online_count = presence::refresh(&mut session.players, self.clock.now_ms(), viewer);
        SessionSnapshot {
            session,
            online_count,
        }
    }

    /// Read-modify-write with a version guard. Returns the document as stored after
    /// the call (unchanged on `Abort`) and the closure's value.
    pub async fn mutate<T, F>(&self, code: &str, mut apply: F) -> Result<(Session, T), ServiceError>
    where
        F: FnMut(&mut Session, i64) -> Result<Outcome<T>, ServiceError> + Send,
        T: Send,
    {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let current = self
                .store
                .get_session(code)
                .await?
                .ok_or(ServiceError::SessionNotFound)?;
            let now = self.clock.now_ms();
            let mut next = current.clone();

            let (kind, value) = match apply(&mut next, now)? {
                Outcome::Abort(value) => return Ok((current, value)),
                Outcome::Commit(kind, value) => (kind, value),
            };

            // Identity fields and a decided winner are not for mutations to change.
            next.id = current.id.clone();
            next.code = current.code.clone();
            next.admin_secret = current.admin_secret.clone();
            next.created_at = current.created_at;
            if current.winner.is_some() {
                next.winner = current.winner.clone();
            }
            next.version = current.version + 1;
            next.touch(now);
            next.validate()?;

            if self
                .store
                .put_session_if_version(&next, Some(current.version))
                .await?
            {
                self.notifier
                    .publish(code, ChangeNotice::new(kind, now))
                    .await;
                return Ok((next, value));
            }

            metrics::store_conflict();
            debug!(session = %code, attempt, "version conflict; retrying write");
            tokio::task::yield_now().await;
        }
        Err(ServiceError::Conflict)
    }

    pub async fn create(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CreateSessionResponse, ServiceError> {
        if request.title.trim().is_empty() {
            return Err(ValidationError::MissingField("title").into());
        }
        let secret = generate_admin_secret();
        let now = self.clock.now_ms();
        let items = request
            .items
            .into_iter()
            .enumerate()
            .map(|(position, text)| Item::new(generate_item_id(), text, position as u32))
            .collect::<Vec<_>>();

        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = generate_join_code();
            let mut session = Session::new(
                generate_session_id(),
                code.clone(),
                request.title.trim(),
                items.clone(),
                request.settings.clone().unwrap_or_default(),
                now,
            );
            session.admin_secret = Some(hash_secret(&secret));
            session.version = 1;
            session.validate()?;

            if self.store.put_session_if_version(&session, None).await? {
                info!(session = %code, items = session.items.len(), "session created");
                return Ok(CreateSessionResponse {
                    code,
                    admin_secret: secret,
                    game: session.redacted(),
                });
            }
            debug!(session = %code, "join code collision; regenerating");
        }
        Err(ServiceError::Conflict)
    }

    pub async fn join(&self, code: &str, request: JoinRequest) -> Result<Session, ServiceError> {
        if request.display_name.trim().is_empty() {
            return Err(ValidationError::MissingField("displayName").into());
        }
        let (session, _) = self
            .mutate(code, |session, now| {
                let joined =
                    session.upsert_player(&request.player_id, &request.display_name, now)?;
                let kind = if joined {
                    ChangeKind::PlayerJoined
                } else {
                    ChangeKind::Presence
                };
                Ok(Outcome::Commit(kind, ()))
            })
            .await?;
        Ok(session)
    }

    /// Places or removes one player's mark. Idempotent: repeating it writes nothing.
    pub async fn set_mark(&self, code: &str, request: MarkRequest) -> Result<Session, ServiceError> {
        let (session, _) = self
            .mutate(code, |session, now| {
                let joined =
                    session.upsert_player(&request.player_id, &request.display_name, now)?;
                let changed = if request.marked {
                    session.mark(
                        request.position,
                        &request.player_id,
                        &request.display_name,
                        now,
                    )?
                } else {
                    session.unmark(request.position, &request.player_id)?
                };
                Ok(match (joined, changed) {
                    (true, _) => Outcome::Commit(ChangeKind::PlayerJoined, ()),
                    (false, true) => Outcome::Commit(ChangeKind::Update, ()),
                    (false, false) => Outcome::Abort(()),
                })
            })
            .await?;
        Ok(session)
    }

    pub async fn heartbeat(&self, code: &str, player_id: &str) -> Result<Session, ServiceError> {
        let (session, _) = self
            .mutate(code, |session, now| {
                if session.touch_player(player_id, now) {
                    Ok(Outcome::Commit(ChangeKind::Presence, ()))
                } else {
                    Err(ServiceError::PlayerNotFound(player_id.to_string()))
                }
            })
            .await?;
        Ok(session)
    }

    /// Whole-document write. Only the admin-owned fields (title, settings, items) are
    /// taken from `document`; marks on surviving items, the player list, identity and
    /// any decided winner stay as stored. The published kind is inferred by diffing,
    /// since the caller did not say what it changed.
    pub async fn write_document(
        &self,
        code: &str,
        document: Session,
        admin_secret: Option<&str>,
    ) -> Result<Session, ServiceError> {
        document.validate()?;
        if document.code != code {
            return Err(ValidationError::CodeMismatch {
                expected: code.to_string(),
                found: document.code,
            }
            .into());
        }

        let (session, _) = self
            .mutate(code, |session, _now| {
                let previous = session.clone();
                let items = document
                    .items
                    .iter()
                    .map(|incoming| {
                        let mut item = incoming.clone();
                        item.marked_by = previous
                            .items
                            .iter()
                            .find(|stored| stored.id == incoming.id)
                            .map(|stored| stored.marked_by.clone())
                            .unwrap_or_default();
                        item
                    })
                    .collect::<Vec<_>>();

                let edits = session.title != document.title
                    || session.settings != document.settings
                    || items != session.items;
                if !edits {
                    return Ok(Outcome::Abort(()));
                }
                let authorized = match (admin_secret, previous.admin_secret.as_deref()) {
                    (Some(secret), Some(hash)) => verify_secret(secret, hash),
                    _ => false,
                };
                if !authorized {
                    return Err(ServiceError::Forbidden);
                }

                session.title = document.title.clone();
                session.settings = document.settings.clone();
                session.items = items;
                Ok(Outcome::Commit(
                    ChangeKind::classify(Some(&previous), session),
                    (),
                ))
            })
            .await?;
        Ok(session)
    }

    pub async fn player_state(
        &self,
        code: &str,
        player_id: &str,
    ) -> Result<Option<PlayerState>, ServiceError> {
        Ok(self.store.get_player_state(code, player_id).await?)
    }

    pub async fn save_player_state(
        &self,
        code: &str,
        player_id: &str,
        state: PlayerState,
    ) -> Result<PlayerState, ServiceError> {
        state.validate()?;
        if state.code != code {
            return Err(ValidationError::CodeMismatch {
                expected: code.to_string(),
                found: state.code,
            }
            .into());
        }
        if state.player_id != player_id {
            return Err(ValidationError::PlayerMismatch {
                expected: player_id.to_string(),
                found: state.player_id,
            }
            .into());
        }
        if self.store.get_session(code).await?.is_none() {
            return Err(ServiceError::SessionNotFound);
        }
        self.store.put_player_state(&state).await?;
        Ok(state)
    }
}
