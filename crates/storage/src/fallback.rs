//! Durable store with a process-local fallback mirror.
//!
//! Every write goes to the durable store first and is mirrored into memory on
//! success. When the durable store errors or exceeds the call timeout the
//! operation is served by the mirror instead, and the response is tagged
//! [`Backend::Fallback`].
//!
//! Exactly one copy of a session is authoritative. A session becomes *pinned*
//! to the mirror when it was created there or when a durable write for it
//! failed; from then on every operation on it goes to the mirror until an
//! operator calls [`FallbackStore::reconcile`]. The mirror is process-local:
//! behind several replicas, requests for a pinned session need session
//! affinity.
//!
//! A durable session is *hydrated* into the mirror (row and attempts) the
//! first time it is served, so pinning it later never leaves the mirror with
//! a partial attempt set.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pyq_core::model::{
    Attempt, Question, QuestionId, Session, SessionId, SessionPatch, StatusFilter, UserId,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::repository::{
    AttemptRepository, InMemoryRepository, SessionRepository, Storage, StorageError,
};

/// Default bound on a single durable-store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);

/// Which backend served a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Durable,
    Fallback,
}

impl Backend {
    #[must_use]
    pub fn is_fallback(self) -> bool {
        self == Backend::Fallback
    }

    /// `Fallback` if either side was served by the fallback.
    #[must_use]
    pub fn combine(self, other: Backend) -> Backend {
        if self.is_fallback() || other.is_fallback() {
            Backend::Fallback
        } else {
            Backend::Durable
        }
    }
}

/// A value together with the backend that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Stored<T> {
    pub value: T,
    pub backend: Backend,
}

impl<T> Stored<T> {
    fn durable(value: T) -> Self {
        Self {
            value,
            backend: Backend::Durable,
        }
    }

    fn fallback(value: T) -> Self {
        Self {
            value,
            backend: Backend::Fallback,
        }
    }

    #[must_use]
    pub fn is_fallback(&self) -> bool {
        self.backend.is_fallback()
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Stored<U> {
        Stored {
            value: f(self.value),
            backend: self.backend,
        }
    }
}

#[derive(Clone)]
struct Durable {
    sessions: Arc<dyn SessionRepository>,
    attempts: Arc<dyn AttemptRepository>,
}

/// Fallback-aware session and attempt store.
#[derive(Clone)]
pub struct FallbackStore {
    durable: Option<Durable>,
    mirror: InMemoryRepository,
    pinned: Arc<Mutex<HashSet<SessionId>>>,
    hydrated: Arc<Mutex<HashSet<SessionId>>>,
    /// Ids whose durable create timed out or failed; a late commit under one
    /// of them must not surface.
    abandoned: Arc<Mutex<HashSet<SessionId>>>,
    timeout: Duration,
}

impl FallbackStore {
    /// Compose a durable backend with a fresh in-memory mirror.
    #[must_use]
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        attempts: Arc<dyn AttemptRepository>,
    ) -> Self {
        Self {
            durable: Some(Durable { sessions, attempts }),
            mirror: InMemoryRepository::new(),
            pinned: Arc::default(),
            hydrated: Arc::default(),
            abandoned: Arc::default(),
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Use the session and attempt repositories of `storage` as the durable side.
    #[must_use]
    pub fn from_storage(storage: &Storage) -> Self {
        Self::new(storage.sessions.clone(), storage.attempts.clone())
    }

    /// No durable store configured; everything lives in the mirror.
    #[must_use]
    pub fn memory_only() -> Self {
        Self {
            durable: None,
            mirror: InMemoryRepository::new(),
            pinned: Arc::default(),
            hydrated: Arc::default(),
            abandoned: Arc::default(),
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    //
    // ─── SESSIONS ──────────────────────────────────────────────────────────────
    //

    /// Persist a new session.
    ///
    /// If the durable insert fails the session is stored in the mirror under a
    /// freshly generated id and pinned there; the returned session carries the
    /// id that was actually used. The original id is remembered as abandoned
    /// and filtered from listings in case the insert still commits.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Conflict` if the durable store rejects the id, or
    /// a mirror error.
    pub async fn create(&self, session: Session) -> Result<Stored<Session>, StorageError> {
        let Some(durable) = self.durable_for(session.id())? else {
            self.mirror.insert_session(&session).await?;
            self.pin(session.id())?;
            return Ok(Stored::fallback(session));
        };

        match self
            .bounded("create_session", durable.sessions.insert_session(&session))
            .await
        {
            Ok(()) => {
                self.mirror.save_session(&session).await?;
                mark(&self.hydrated, session.id())?;
                debug!(session_id = %session.id(), "session created in durable store");
                Ok(Stored::durable(session))
            }
            Err(e) if e.is_unavailable() => {
                let abandoned = session.id();
                mark(&self.abandoned, abandoned)?;
                let session = session.with_id(SessionId::generate());
                warn!(
                    session_id = %session.id(),
                    abandoned_id = %abandoned,
                    error = %e,
                    "durable create failed; session lives in fallback only"
                );
                self.mirror.insert_session(&session).await?;
                self.pin(session.id())?;
                Ok(Stored::fallback(session))
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch a session from whichever store is authoritative for it.
    ///
    /// # Errors
    ///
    /// Returns mirror errors; durable failures degrade to the mirror.
    pub async fn get(&self, id: SessionId) -> Result<Option<Stored<Session>>, StorageError> {
        let Some(durable) = self.durable_for(id)? else {
            return Ok(self.mirror.get_session(id).await?.map(Stored::fallback));
        };

        match self
            .bounded("get_session", durable.sessions.get_session(id))
            .await
        {
            Ok(Some(session)) => {
                self.mirror.save_session(&session).await?;
                self.hydrate(&durable, id).await?;
                Ok(Some(Stored::durable(session)))
            }
            Ok(None) => Ok(None),
            Err(e) if e.is_unavailable() => {
                warn!(session_id = %id, error = %e, "durable get failed; reading fallback");
                Ok(self.mirror.get_session(id).await?.map(Stored::fallback))
            }
            Err(e) => Err(e),
        }
    }

    /// Apply a patch in the authoritative store.
    ///
    /// A durable failure applies the patch to the mirror and pins the session
    /// there, since the mirror now holds the newest state.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if neither store can serve the session.
    pub async fn update(
        &self,
        id: SessionId,
        patch: &SessionPatch,
    ) -> Result<Stored<Session>, StorageError> {
        let Some(durable) = self.durable_for(id)? else {
            return self.mirror.update_session(id, patch).await.map(Stored::fallback);
        };

        match self
            .bounded("update_session", durable.sessions.update_session(id, patch))
            .await
        {
            Ok(session) => {
                self.mirror.save_session(&session).await?;
                Ok(Stored::durable(session))
            }
            Err(e) if e.is_unavailable() => {
                warn!(session_id = %id, error = %e, "durable update failed; writing fallback");
                self.hydrate(&durable, id).await?;
                let session = self.mirror.update_session(id, patch).await?;
                self.pin(id)?;
                Ok(Stored::fallback(session))
            }
            Err(e) => Err(e),
        }
    }

    /// List a user's sessions, newest first.
    ///
    /// Each row carries the backend its copy came from; sessions pinned to the
    /// fallback are always reported from the mirror.
    ///
    /// # Errors
    ///
    /// Returns mirror errors; durable failures degrade to the mirror.
    pub async fn list_by_user(
        &self,
        user_id: &UserId,
        status: StatusFilter,
    ) -> Result<Stored<Vec<Stored<Session>>>, StorageError> {
        let mirrored = self.mirror.list_sessions(user_id, status).await?;
        let all_mirrored = |sessions: Vec<Session>| {
            Stored::fallback(sessions.into_iter().map(Stored::fallback).collect::<Vec<_>>())
        };
        let Some(durable) = self.durable.clone() else {
            return Ok(all_mirrored(mirrored));
        };

        match self
            .bounded("list_sessions", durable.sessions.list_sessions(user_id, status))
            .await
        {
            Ok(from_durable) => {
                let pinned = self.pinned_set()?;
                let abandoned = self.abandoned_set()?;
                let mut out: Vec<Stored<Session>> = from_durable
                    .into_iter()
                    .filter(|s| !pinned.contains(&s.id()) && !abandoned.contains(&s.id()))
                    .map(Stored::durable)
                    .collect();
                let before = out.len();
                out.extend(
                    mirrored
                        .into_iter()
                        .filter(|s| pinned.contains(&s.id()))
                        .map(Stored::fallback),
                );
                let backend = if out.len() == before {
                    Backend::Durable
                } else {
                    Backend::Fallback
                };
                out.sort_by(|a, b| b.value.start_time().cmp(&a.value.start_time()));
                Ok(Stored {
                    value: out,
                    backend,
                })
            }
            Err(e) if e.is_unavailable() => {
                warn!(user_id = %user_id, error = %e, "durable list failed; reading fallback");
                Ok(all_mirrored(mirrored))
            }
            Err(e) => Err(e),
        }
    }

    //
    // ─── ATTEMPTS ──────────────────────────────────────────────────────────────
    //

    /// Record an attempt, keeping the response id of any earlier attempt for
    /// the same question.
    ///
    /// # Errors
    ///
    /// Returns mirror errors; durable failures degrade to the mirror and pin
    /// the session.
    pub async fn record_attempt(&self, attempt: &Attempt) -> Result<Stored<Attempt>, StorageError> {
        let session_id = attempt.session_id;
        let Some(durable) = self.durable_for(session_id)? else {
            return self.mirror.record_attempt(attempt).await.map(Stored::fallback);
        };

        match self
            .bounded("record_attempt", durable.attempts.record_attempt(attempt))
            .await
        {
            Ok(stored) => {
                self.mirror.save_attempt(&stored).await?;
                Ok(Stored::durable(stored))
            }
            Err(e) if e.is_unavailable() => {
                warn!(session_id = %session_id, error = %e, "durable attempt write failed; writing fallback");
                self.hydrate(&durable, session_id).await?;
                let stored = self.mirror.record_attempt(attempt).await?;
                self.pin(session_id)?;
                Ok(Stored::fallback(stored))
            }
            Err(e) => Err(e),
        }
    }

    /// All attempts recorded for a session.
    ///
    /// # Errors
    ///
    /// Returns mirror errors; durable failures degrade to the mirror.
    pub async fn attempts(&self, session_id: SessionId) -> Result<Stored<Vec<Attempt>>, StorageError> {
        let Some(durable) = self.durable_for(session_id)? else {
            return self
                .mirror
                .attempts_for_session(session_id)
                .await
                .map(Stored::fallback);
        };

        match self
            .bounded("attempts_for_session", durable.attempts.attempts_for_session(session_id))
            .await
        {
            Ok(attempts) => {
                for attempt in &attempts {
                    self.mirror.save_attempt(attempt).await?;
                }
                mark(&self.hydrated, session_id)?;
                Ok(Stored::durable(attempts))
            }
            Err(e) if e.is_unavailable() => {
                warn!(session_id = %session_id, error = %e, "durable attempt read failed; reading fallback");
                self.mirror
                    .attempts_for_session(session_id)
                    .await
                    .map(Stored::fallback)
            }
            Err(e) => Err(e),
        }
    }

    /// The attempt for one question, if any.
    ///
    /// # Errors
    ///
    /// Returns mirror errors; durable failures degrade to the mirror.
    pub async fn attempt_for(
        &self,
        session_id: SessionId,
        question_id: &QuestionId,
    ) -> Result<Stored<Option<Attempt>>, StorageError> {
        let Some(durable) = self.durable_for(session_id)? else {
            return self
                .mirror
                .attempt_for_question(session_id, question_id)
                .await
                .map(Stored::fallback);
        };

        match self
            .bounded(
                "attempt_for_question",
                durable.attempts.attempt_for_question(session_id, question_id),
            )
            .await
        {
            Ok(found) => Ok(Stored::durable(found)),
            Err(e) if e.is_unavailable() => {
                warn!(session_id = %session_id, error = %e, "durable attempt lookup failed; reading fallback");
                self.mirror
                    .attempt_for_question(session_id, question_id)
                    .await
                    .map(Stored::fallback)
            }
            Err(e) => Err(e),
        }
    }

    /// Questions the user has answered correctly anywhere.
    ///
    /// # Errors
    ///
    /// Returns mirror errors; durable failures degrade to the mirror.
    pub async fn solved_question_ids(
        &self,
        user_id: &UserId,
    ) -> Result<Stored<HashSet<QuestionId>>, StorageError> {
        let mirrored = self.mirror.solved_question_ids(user_id).await?;
        let Some(durable) = self.durable.clone() else {
            return Ok(Stored::fallback(mirrored));
        };

        match self
            .bounded("solved_question_ids", durable.attempts.solved_question_ids(user_id))
            .await
        {
            Ok(mut solved) => {
                // Pinned sessions only exist in the mirror.
                solved.extend(mirrored);
                Ok(Stored::durable(solved))
            }
            Err(e) if e.is_unavailable() => {
                warn!(user_id = %user_id, error = %e, "durable solved lookup failed; reading fallback");
                Ok(Stored::fallback(mirrored))
            }
            Err(e) => Err(e),
        }
    }

    //
    // ─── QUESTION SNAPSHOTS ────────────────────────────────────────────────────
    //

    /// Keep the questions a session was built from, for when the question
    /// source is unreachable later.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Connection` if the mirror lock is poisoned.
    pub fn snapshot_questions(
        &self,
        session_id: SessionId,
        questions: &[Question],
    ) -> Result<(), StorageError> {
        self.mirror.remember_questions(session_id, questions)
    }

    /// # Errors
    ///
    /// Returns `StorageError::Connection` if the mirror lock is poisoned.
    pub fn snapshot_question(
        &self,
        session_id: SessionId,
        question_id: &QuestionId,
    ) -> Result<Option<Question>, StorageError> {
        self.mirror.banked_question(session_id, question_id)
    }

    //
    // ─── RECONCILIATION ────────────────────────────────────────────────────────
    //

    /// Sessions whose authoritative copy is the in-memory mirror.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Connection` if the lock is poisoned.
    pub fn pinned_sessions(&self) -> Result<Vec<SessionId>, StorageError> {
        let mut ids: Vec<SessionId> = self.pinned_set()?.into_iter().collect();
        ids.sort();
        Ok(ids)
    }

    /// # Errors
    ///
    /// Returns `StorageError::Connection` if the lock is poisoned.
    pub fn is_pinned(&self, id: SessionId) -> Result<bool, StorageError> {
        Ok(self.pinned_set()?.contains(&id))
    }

    /// Ids whose durable create was given up on.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Connection` if the lock is poisoned.
    pub fn abandoned_sessions(&self) -> Result<Vec<SessionId>, StorageError> {
        let mut ids: Vec<SessionId> = self.abandoned_set()?.into_iter().collect();
        ids.sort();
        Ok(ids)
    }

    /// Copy a pinned session and its attempts into the durable store and hand
    /// authority back to it.
    ///
    /// Durable attempts the mirror never saw are merged in first (mirror wins
    /// per question) and the counters are recounted over the merged set, so
    /// the durable row never ends up with fewer answers than it had.
    ///
    /// Operator-triggered only; nothing calls this automatically.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the mirror lacks the session,
    /// `StorageError::Connection` if no durable store is configured, or the
    /// durable error that stopped the copy (the session then stays pinned).
    pub async fn reconcile(&self, id: SessionId) -> Result<(), StorageError> {
        let Some(durable) = self.durable.clone() else {
            return Err(StorageError::Connection("no durable store configured".into()));
        };
        let mut session = self
            .mirror
            .get_session(id)
            .await?
            .ok_or(StorageError::NotFound)?;

        let from_durable = self
            .bounded("reconcile_read", durable.attempts.attempts_for_session(id))
            .await?;
        for attempt in &from_durable {
            if self
                .mirror
                .attempt_for_question(id, &attempt.question_id)
                .await?
                .is_none()
            {
                self.mirror.save_attempt(attempt).await?;
            }
        }
        let attempts = self.mirror.attempts_for_session(id).await?;
        let last_activity = session.last_activity();
        session.recount(&attempts, last_activity);
        self.mirror.save_session(&session).await?;

        self.bounded("reconcile_session", durable.sessions.save_session(&session))
            .await?;
        for attempt in &attempts {
            self.bounded("reconcile_attempt", durable.attempts.save_attempt(attempt))
                .await?;
        }

        mark(&self.hydrated, id)?;
        self.pinned
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?
            .remove(&id);
        info!(session_id = %id, attempts = attempts.len(), "session reconciled into durable store");
        Ok(())
    }

    //
    // ─── INTERNALS ─────────────────────────────────────────────────────────────
    //

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout {
                op,
                after: self.timeout,
            }),
        }
    }

    /// The durable backend, unless `id` is pinned or none is configured.
    fn durable_for(&self, id: SessionId) -> Result<Option<Durable>, StorageError> {
        if self.is_pinned(id)? {
            return Ok(None);
        }
        Ok(self.durable.clone())
    }

    /// Copy a durable session's attempts into the mirror once per process.
    ///
    /// An outage here only logs: the session is then served with whatever the
    /// mirror holds and [`FallbackStore::reconcile`] merges the rest back.
    async fn hydrate(&self, durable: &Durable, id: SessionId) -> Result<(), StorageError> {
        if is_marked(&self.hydrated, id)? {
            return Ok(());
        }
        match self
            .bounded("hydrate_attempts", durable.attempts.attempts_for_session(id))
            .await
        {
            Ok(attempts) => {
                for attempt in &attempts {
                    self.mirror.save_attempt(attempt).await?;
                }
                mark(&self.hydrated, id)?;
                debug!(session_id = %id, attempts = attempts.len(), "session hydrated into mirror");
                Ok(())
            }
            Err(e) if e.is_unavailable() => {
                warn!(session_id = %id, error = %e, "could not hydrate attempts into mirror");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn abandoned_set(&self) -> Result<HashSet<SessionId>, StorageError> {
        Ok(self
            .abandoned
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?
            .clone())
    }

    fn pin(&self, id: SessionId) -> Result<(), StorageError> {
        let newly = self
            .pinned
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?
            .insert(id);
        if newly && self.durable.is_some() {
            warn!(session_id = %id, "session pinned to fallback; reconcile to restore durability");
        }
        Ok(())
    }

    fn pinned_set(&self) -> Result<HashSet<SessionId>, StorageError> {
        Ok(self
            .pinned
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?
            .clone())
    }
}

fn mark(set: &Mutex<HashSet<SessionId>>, id: SessionId) -> Result<(), StorageError> {
    set.lock()
        .map_err(|e| StorageError::Connection(e.to_string()))?
        .insert(id);
    Ok(())
}

fn is_marked(set: &Mutex<HashSet<SessionId>>, id: SessionId) -> Result<bool, StorageError> {
    Ok(set
        .lock()
        .map_err(|e| StorageError::Connection(e.to_string()))?
        .contains(&id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pyq_core::model::{SessionFilter, SessionStatus};
    use pyq_core::time::fixed_now;

    /// Durable double whose every call fails with a connection error.
    struct FailingRepository;

    #[async_trait]
    impl SessionRepository for FailingRepository {
        async fn insert_session(&self, _: &Session) -> Result<(), StorageError> {
            Err(StorageError::Connection("down".into()))
        }
        async fn save_session(&self, _: &Session) -> Result<(), StorageError> {
            Err(StorageError::Connection("down".into()))
        }
        async fn get_session(&self, _: SessionId) -> Result<Option<Session>, StorageError> {
            Err(StorageError::Connection("down".into()))
        }
        async fn update_session(
            &self,
            _: SessionId,
            _: &SessionPatch,
        ) -> Result<Session, StorageError> {
            Err(StorageError::Connection("down".into()))
        }
        async fn list_sessions(
            &self,
            _: &UserId,
            _: StatusFilter,
        ) -> Result<Vec<Session>, StorageError> {
            Err(StorageError::Connection("down".into()))
        }
    }

    #[async_trait]
    impl AttemptRepository for FailingRepository {
        async fn record_attempt(&self, _: &Attempt) -> Result<Attempt, StorageError> {
            Err(StorageError::Connection("down".into()))
        }
        async fn save_attempt(&self, _: &Attempt) -> Result<(), StorageError> {
            Err(StorageError::Connection("down".into()))
        }
        async fn attempts_for_session(&self, _: SessionId) -> Result<Vec<Attempt>, StorageError> {
            Err(StorageError::Connection("down".into()))
        }
        async fn attempt_for_question(
            &self,
            _: SessionId,
            _: &QuestionId,
        ) -> Result<Option<Attempt>, StorageError> {
            Err(StorageError::Connection("down".into()))
        }
        async fn solved_question_ids(
            &self,
            _: &UserId,
        ) -> Result<HashSet<QuestionId>, StorageError> {
            Err(StorageError::Connection("down".into()))
        }
    }

    /// Durable double that never answers.
    struct StallingRepository;

    #[async_trait]
    impl SessionRepository for StallingRepository {
        async fn insert_session(&self, _: &Session) -> Result<(), StorageError> {
            std::future::pending().await
        }
        async fn save_session(&self, _: &Session) -> Result<(), StorageError> {
            std::future::pending().await
        }
        async fn get_session(&self, _: SessionId) -> Result<Option<Session>, StorageError> {
            std::future::pending().await
        }
        async fn update_session(
            &self,
            _: SessionId,
            _: &SessionPatch,
        ) -> Result<Session, StorageError> {
            std::future::pending().await
        }
        async fn list_sessions(
            &self,
            _: &UserId,
            _: StatusFilter,
        ) -> Result<Vec<Session>, StorageError> {
            std::future::pending().await
        }
    }

    /// Durable attempts that accept reads but refuse new answers.
    struct AttemptWritesFail(InMemoryRepository);

    #[async_trait]
    impl AttemptRepository for AttemptWritesFail {
        async fn record_attempt(&self, _: &Attempt) -> Result<Attempt, StorageError> {
            Err(StorageError::Connection("write refused".into()))
        }
        async fn save_attempt(&self, attempt: &Attempt) -> Result<(), StorageError> {
            self.0.save_attempt(attempt).await
        }
        async fn attempts_for_session(&self, id: SessionId) -> Result<Vec<Attempt>, StorageError> {
            self.0.attempts_for_session(id).await
        }
        async fn attempt_for_question(
            &self,
            id: SessionId,
            question_id: &QuestionId,
        ) -> Result<Option<Attempt>, StorageError> {
            self.0.attempt_for_question(id, question_id).await
        }
        async fn solved_question_ids(
            &self,
            user_id: &UserId,
        ) -> Result<HashSet<QuestionId>, StorageError> {
            self.0.solved_question_ids(user_id).await
        }
    }

    /// Durable sessions whose inserts hang past any timeout and then commit.
    struct LateInsertRepository(InMemoryRepository);

    #[async_trait]
    impl SessionRepository for LateInsertRepository {
        async fn insert_session(&self, session: &Session) -> Result<(), StorageError> {
            let inner = self.0.clone();
            let session = session.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let _ = inner.insert_session(&session).await;
            });
            std::future::pending().await
        }
        async fn save_session(&self, session: &Session) -> Result<(), StorageError> {
            self.0.save_session(session).await
        }
        async fn get_session(&self, id: SessionId) -> Result<Option<Session>, StorageError> {
            self.0.get_session(id).await
        }
        async fn update_session(
            &self,
            id: SessionId,
            patch: &SessionPatch,
        ) -> Result<Session, StorageError> {
            self.0.update_session(id, patch).await
        }
        async fn list_sessions(
            &self,
            user_id: &UserId,
            status: StatusFilter,
        ) -> Result<Vec<Session>, StorageError> {
            self.0.list_sessions(user_id, status).await
        }
    }

    fn session(user: &str) -> Session {
        Session::new(
            SessionId::generate(),
            UserId::new(user),
            "Practice",
            SessionFilter::new(),
            vec![QuestionId::new("q0"), QuestionId::new("q1")],
            None,
            fixed_now(),
        )
        .unwrap()
    }

    fn durable_pair() -> (InMemoryRepository, FallbackStore) {
        let durable = InMemoryRepository::new();
        let store = FallbackStore::new(Arc::new(durable.clone()), Arc::new(durable.clone()));
        (durable, store)
    }

    fn failing_store() -> FallbackStore {
        FallbackStore::new(Arc::new(FailingRepository), Arc::new(FailingRepository))
    }

    #[tokio::test]
    async fn healthy_create_writes_through_and_mirrors() {
        let (durable, store) = durable_pair();
        let s = session("u1");
        let created = store.create(s.clone()).await.unwrap();
        assert_eq!(created.backend, Backend::Durable);
        assert_eq!(created.value.id(), s.id());
        assert!(durable.get_session(s.id()).await.unwrap().is_some());
        assert!(store.mirror.get_session(s.id()).await.unwrap().is_some());
        assert!(!store.is_pinned(s.id()).unwrap());
    }

    #[tokio::test]
    async fn failed_create_synthesizes_new_id_in_fallback() {
        let store = failing_store();
        let s = session("u1");
        let created = store.create(s.clone()).await.unwrap();
        assert!(created.is_fallback());
        assert_ne!(created.value.id(), s.id());
        assert!(store.is_pinned(created.value.id()).unwrap());

        let fetched = store.get(created.value.id()).await.unwrap().unwrap();
        assert!(fetched.is_fallback());
        assert_eq!(fetched.value.question_ids(), s.question_ids());
    }

    #[tokio::test]
    async fn whole_lifetime_on_failing_durable_store() {
        let store = failing_store();
        let id = store.create(session("u1")).await.unwrap().value.id();

        let updated = store
            .update(id, &SessionPatch::cursor(1, fixed_now()))
            .await
            .unwrap();
        assert!(updated.is_fallback());
        assert_eq!(updated.value.current_index(), 1);

        let q = QuestionId::new("q0");
        let a1 = store
            .record_attempt(&Attempt::new(id, q.clone(), "A", true, 5, fixed_now()))
            .await
            .unwrap();
        let a2 = store
            .record_attempt(&Attempt::new(id, q.clone(), "B", false, 6, fixed_now()))
            .await
            .unwrap();
        assert!(a2.is_fallback());
        assert_eq!(a1.value.id, a2.value.id);

        let attempts = store.attempts(id).await.unwrap();
        assert!(attempts.is_fallback());
        assert_eq!(attempts.value.len(), 1);

        let listed = store
            .list_by_user(&UserId::new("u1"), StatusFilter::All)
            .await
            .unwrap();
        assert!(listed.is_fallback());
        assert_eq!(listed.value.len(), 1);
    }

    #[tokio::test]
    async fn missing_everywhere_is_none() {
        let store = failing_store();
        assert!(store.get(SessionId::generate()).await.unwrap().is_none());
        let err = store
            .update(SessionId::generate(), &SessionPatch::touch(fixed_now()))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound));
    }

    #[tokio::test]
    async fn durable_update_failure_pins_session_to_mirror() {
        let (durable, _) = durable_pair();
        let s = session("u1");
        durable.insert_session(&s).await.unwrap();

        // Same durable data, but the store loses its connection mid-session.
        let flaky = FallbackStore::new(Arc::new(durable.clone()), Arc::new(durable.clone()));
        flaky.mirror.save_session(&s).await.unwrap();
        let broken = FallbackStore {
            durable: Some(Durable {
                sessions: Arc::new(FailingRepository),
                attempts: Arc::new(FailingRepository),
            }),
            ..flaky.clone()
        };

        let moved = broken
            .update(s.id(), &SessionPatch::cursor(1, fixed_now()))
            .await
            .unwrap();
        assert!(moved.is_fallback());
        assert!(flaky.is_pinned(s.id()).unwrap());

        // The healthy handle now reads the mirror rather than the stale durable row.
        let read = flaky.get(s.id()).await.unwrap().unwrap();
        assert!(read.is_fallback());
        assert_eq!(read.value.current_index(), 1);
        assert_eq!(
            durable.get_session(s.id()).await.unwrap().unwrap().current_index(),
            0
        );

        flaky.reconcile(s.id()).await.unwrap();
        assert!(!flaky.is_pinned(s.id()).unwrap());
        assert_eq!(
            durable.get_session(s.id()).await.unwrap().unwrap().current_index(),
            1
        );
        let read = flaky.get(s.id()).await.unwrap().unwrap();
        assert_eq!(read.backend, Backend::Durable);
    }

    #[tokio::test]
    async fn pinning_a_restored_session_keeps_its_durable_attempts() {
        let durable = InMemoryRepository::new();
        let s = session("u1");
        durable.insert_session(&s).await.unwrap();
        durable
            .record_attempt(&Attempt::new(s.id(), QuestionId::new("q0"), "A", true, 5, fixed_now()))
            .await
            .unwrap();

        // A fresh process: empty mirror, and the first answer it takes fails durably.
        let store = FallbackStore::new(
            Arc::new(durable.clone()),
            Arc::new(AttemptWritesFail(durable.clone())),
        );
        let second = store
            .record_attempt(&Attempt::new(s.id(), QuestionId::new("q1"), "B", false, 3, fixed_now()))
            .await
            .unwrap();
        assert!(second.is_fallback());
        assert!(store.is_pinned(s.id()).unwrap());

        let attempts = store.attempts(s.id()).await.unwrap();
        assert!(attempts.is_fallback());
        let answered: HashSet<QuestionId> =
            attempts.value.into_iter().map(|a| a.question_id).collect();
        assert_eq!(
            answered,
            HashSet::from([QuestionId::new("q0"), QuestionId::new("q1")])
        );
    }

    #[tokio::test]
    async fn reconcile_merges_attempts_the_mirror_never_saw() {
        let durable = InMemoryRepository::new();
        let mut s = session("u1");
        let first = Attempt::new(s.id(), QuestionId::new("q0"), "A", true, 5, fixed_now());
        durable.record_attempt(&first).await.unwrap();
        s.recount(std::slice::from_ref(&first), fixed_now());
        durable.insert_session(&s).await.unwrap();

        // Durable goes fully dark before the mirror could load q0.
        let healthy = FallbackStore::new(Arc::new(durable.clone()), Arc::new(durable.clone()));
        healthy.mirror.save_session(&s).await.unwrap();
        let broken = FallbackStore {
            durable: Some(Durable {
                sessions: Arc::new(FailingRepository),
                attempts: Arc::new(FailingRepository),
            }),
            ..healthy.clone()
        };
        broken
            .record_attempt(&Attempt::new(s.id(), QuestionId::new("q1"), "B", true, 4, fixed_now()))
            .await
            .unwrap();
        assert!(healthy.is_pinned(s.id()).unwrap());

        healthy.reconcile(s.id()).await.unwrap();

        let stored = durable.get_session(s.id()).await.unwrap().unwrap();
        assert_eq!(stored.counters().answered, 2);
        assert_eq!(stored.counters().correct, 2);
        assert_eq!(stored.status(), SessionStatus::Completed);
        assert_eq!(durable.attempts_for_session(s.id()).await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn late_commit_of_a_timed_out_create_stays_hidden() {
        let durable = InMemoryRepository::new();
        let store = FallbackStore::new(
            Arc::new(LateInsertRepository(durable.clone())),
            Arc::new(durable.clone()),
        )
        .with_timeout(Duration::from_millis(50));

        let original = session("u1");
        let created = store.create(original.clone()).await.unwrap();
        assert!(created.is_fallback());
        assert_eq!(store.abandoned_sessions().unwrap(), vec![original.id()]);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(durable.get_session(original.id()).await.unwrap().is_some());

        let listed = store
            .list_by_user(&UserId::new("u1"), StatusFilter::All)
            .await
            .unwrap();
        let ids: Vec<_> = listed.value.iter().map(|s| s.value.id()).collect();
        assert_eq!(ids, vec![created.value.id()]);
    }

    #[tokio::test]
    async fn list_merges_pinned_sessions_without_duplicates() {
        let (durable, store) = durable_pair();
        let healthy = store.create(session("u1")).await.unwrap().value;

        let orphan = session("u1");
        store.mirror.insert_session(&orphan).await.unwrap();
        store.pin(orphan.id()).unwrap();

        let listed = store
            .list_by_user(&UserId::new("u1"), StatusFilter::All)
            .await
            .unwrap();
        assert!(listed.is_fallback());
        let ids: HashSet<_> = listed.value.iter().map(|s| s.value.id()).collect();
        assert_eq!(ids, HashSet::from([healthy.id(), orphan.id()]));
        for row in &listed.value {
            assert_eq!(row.is_fallback(), row.value.id() == orphan.id());
        }
        assert!(durable.get_session(orphan.id()).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_durable_call_times_out_into_fallback() {
        let mirror_backing = InMemoryRepository::new();
        let store = FallbackStore::new(Arc::new(StallingRepository), Arc::new(mirror_backing))
            .with_timeout(Duration::from_millis(50));
        let created = store.create(session("u1")).await.unwrap();
        assert!(created.is_fallback());
    }

    #[tokio::test]
    async fn memory_only_mode_is_always_fallback() {
        let store = FallbackStore::memory_only();
        let created = store.create(session("u1")).await.unwrap();
        assert!(created.is_fallback());
        let fetched = store.get(created.value.id()).await.unwrap().unwrap();
        assert!(fetched.is_fallback());
        assert!(store.reconcile(created.value.id()).await.is_err());
    }

    #[tokio::test]
    async fn question_snapshot_round_trips() {
        let store = FallbackStore::memory_only();
        let id = SessionId::generate();
        let q = Question::new("q0", "?", "A");
        store.snapshot_questions(id, std::slice::from_ref(&q)).unwrap();
        assert_eq!(store.snapshot_question(id, &q.id).unwrap(), Some(q));
    }
}
