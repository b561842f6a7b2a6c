use async_trait::async_trait;
use pyq_core::model::{
    Attempt, Question, QuestionId, Session, SessionFilter, SessionId, SessionPatch, StatusFilter,
    UserId,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

use crate::questions::InMemoryQuestionBank;

/// Errors surfaced by storage adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("conflict")]
    Conflict,

    #[error("connection error: {0}")]
    Connection(String),

    /// A stored row could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The backend answered and refused the write (constraint violation,
    /// invalid patch).
    #[error("rejected by store: {0}")]
    Rejected(String),

    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
}

impl StorageError {
    /// True when the backend could not answer, as opposed to answering "no".
    ///
    /// These are the failures that make the fallback store take over. Corrupt
    /// rows and rejected writes are deterministic and surface as errors.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StorageError::Connection(_) | StorageError::Timeout { .. }
        )
    }
}

/// Errors surfaced by question sources.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QuestionSourceError {
    #[error("question source unavailable: {0}")]
    Unavailable(String),

    #[error("malformed question record: {0}")]
    Malformed(String),
}

/// Persistence contract for session records.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Store a brand-new session.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Conflict` if the id is already taken, or other storage errors.
    async fn insert_session(&self, session: &Session) -> Result<(), StorageError>;

    /// Insert or fully overwrite a session.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the session cannot be stored.
    async fn save_session(&self, session: &Session) -> Result<(), StorageError>;

    /// Fetch a session by id.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures; a missing session is `Ok(None)`.
    async fn get_session(&self, id: SessionId) -> Result<Option<Session>, StorageError>;

    /// Apply a patch and return the updated session.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the session does not exist.
    async fn update_session(
        &self,
        id: SessionId,
        patch: &SessionPatch,
    ) -> Result<Session, StorageError>;

    /// List a user's sessions, newest first.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn list_sessions(
        &self,
        user_id: &UserId,
        status: StatusFilter,
    ) -> Result<Vec<Session>, StorageError>;
}

/// Persistence contract for graded attempts.
#[async_trait]
pub trait AttemptRepository: Send + Sync {
    /// Record a submission, keyed by `(session_id, question_id)`.
    ///
    /// If an attempt already exists for the pair its fields are overwritten and
    /// its id is kept. Returns the attempt as stored.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the attempt cannot be stored.
    async fn record_attempt(&self, attempt: &Attempt) -> Result<Attempt, StorageError>;

    /// Write an attempt verbatim, id included, replacing whatever the pair held.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the attempt cannot be stored.
    async fn save_attempt(&self, attempt: &Attempt) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn attempts_for_session(&self, session_id: SessionId)
    -> Result<Vec<Attempt>, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn attempt_for_question(
        &self,
        session_id: SessionId,
        question_id: &QuestionId,
    ) -> Result<Option<Attempt>, StorageError>;

    /// Questions the user has answered correctly in any session.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn solved_question_ids(&self, user_id: &UserId)
    -> Result<HashSet<QuestionId>, StorageError>;
}

/// Read-only access to the question catalog.
#[async_trait]
pub trait QuestionSource: Send + Sync {
    /// Questions matching `filter`, in catalog order.
    ///
    /// # Errors
    ///
    /// Returns `QuestionSourceError` if the catalog cannot be queried.
    async fn resolve(&self, filter: &SessionFilter) -> Result<Vec<Question>, QuestionSourceError>;

    /// # Errors
    ///
    /// Returns `QuestionSourceError` if the catalog cannot be queried.
    async fn get_question(&self, id: &QuestionId) -> Result<Option<Question>, QuestionSourceError>;
}

type AttemptKey = (SessionId, QuestionId);

/// Process-local repository backed by mutex-guarded maps.
///
/// Serves as the fallback mirror and as a stand-in durable store in tests.
/// Also keeps a per-session snapshot of the questions a session was built from.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    sessions: Arc<Mutex<HashMap<SessionId, Session>>>,
    attempts: Arc<Mutex<HashMap<AttemptKey, Attempt>>>,
    question_banks: Arc<Mutex<HashMap<SessionId, HashMap<QuestionId, Question>>>>,
}

fn poisoned<E: std::fmt::Display>(e: E) -> StorageError {
    StorageError::Connection(e.to_string())
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions held.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.lock().map(|g| g.len()).unwrap_or_default()
    }

    /// Remember the questions a session was built from.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Connection` if the lock is poisoned.
    pub fn remember_questions(
        &self,
        session_id: SessionId,
        questions: &[Question],
    ) -> Result<(), StorageError> {
        let mut guard = self.question_banks.lock().map_err(poisoned)?;
        let bank = guard.entry(session_id).or_default();
        for q in questions {
            bank.insert(q.id.clone(), q.clone());
        }
        Ok(())
    }

    /// Look up a question in a session's snapshot.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Connection` if the lock is poisoned.
    pub fn banked_question(
        &self,
        session_id: SessionId,
        question_id: &QuestionId,
    ) -> Result<Option<Question>, StorageError> {
        let guard = self.question_banks.lock().map_err(poisoned)?;
        Ok(guard
            .get(&session_id)
            .and_then(|bank| bank.get(question_id))
            .cloned())
    }
}

#[async_trait]
impl SessionRepository for InMemoryRepository {
    async fn insert_session(&self, session: &Session) -> Result<(), StorageError> {
        let mut guard = self.sessions.lock().map_err(poisoned)?;
        if guard.contains_key(&session.id()) {
            return Err(StorageError::Conflict);
        }
        guard.insert(session.id(), session.clone());
        Ok(())
    }

    async fn save_session(&self, session: &Session) -> Result<(), StorageError> {
        let mut guard = self.sessions.lock().map_err(poisoned)?;
        guard.insert(session.id(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>, StorageError> {
        let guard = self.sessions.lock().map_err(poisoned)?;
        Ok(guard.get(&id).cloned())
    }

    async fn update_session(
        &self,
        id: SessionId,
        patch: &SessionPatch,
    ) -> Result<Session, StorageError> {
        let mut guard = self.sessions.lock().map_err(poisoned)?;
        let session = guard.get_mut(&id).ok_or(StorageError::NotFound)?;
        session
            .apply_patch(patch)
            .map_err(|e| StorageError::Rejected(e.to_string()))?;
        Ok(session.clone())
    }

    async fn list_sessions(
        &self,
        user_id: &UserId,
        status: StatusFilter,
    ) -> Result<Vec<Session>, StorageError> {
        let guard = self.sessions.lock().map_err(poisoned)?;
        let mut out: Vec<Session> = guard
            .values()
            .filter(|s| s.user_id() == user_id && status.matches(s.status()))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.start_time().cmp(&a.start_time()));
        Ok(out)
    }
}

#[async_trait]
impl AttemptRepository for InMemoryRepository {
    async fn record_attempt(&self, attempt: &Attempt) -> Result<Attempt, StorageError> {
        let mut guard = self.attempts.lock().map_err(poisoned)?;
        let key = (attempt.session_id, attempt.question_id.clone());
        let stored = match guard.get(&key) {
            Some(existing) => existing.superseded_by(attempt.clone()),
            None => attempt.clone(),
        };
        guard.insert(key, stored.clone());
        Ok(stored)
    }

    async fn save_attempt(&self, attempt: &Attempt) -> Result<(), StorageError> {
        let mut guard = self.attempts.lock().map_err(poisoned)?;
        guard.insert(
            (attempt.session_id, attempt.question_id.clone()),
            attempt.clone(),
        );
        Ok(())
    }

    async fn attempts_for_session(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<Attempt>, StorageError> {
        let guard = self.attempts.lock().map_err(poisoned)?;
        let mut out: Vec<Attempt> = guard
            .values()
            .filter(|a| a.session_id == session_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at));
        Ok(out)
    }

    async fn attempt_for_question(
        &self,
        session_id: SessionId,
        question_id: &QuestionId,
    ) -> Result<Option<Attempt>, StorageError> {
        let guard = self.attempts.lock().map_err(poisoned)?;
        Ok(guard.get(&(session_id, question_id.clone())).cloned())
    }

    async fn solved_question_ids(
        &self,
        user_id: &UserId,
    ) -> Result<HashSet<QuestionId>, StorageError> {
        let owned: HashSet<SessionId> = {
            let sessions = self.sessions.lock().map_err(poisoned)?;
            sessions
                .values()
                .filter(|s| s.user_id() == user_id)
                .map(Session::id)
                .collect()
        };
        let guard = self.attempts.lock().map_err(poisoned)?;
        Ok(guard
            .values()
            .filter(|a| a.is_correct && owned.contains(&a.session_id))
            .map(|a| a.question_id.clone())
            .collect())
    }
}

/// Aggregates repositories behind trait objects for easy backend swapping.
#[derive(Clone)]
pub struct Storage {
    pub sessions: Arc<dyn SessionRepository>,
    pub attempts: Arc<dyn AttemptRepository>,
    pub questions: Arc<dyn QuestionSource>,
}

impl Storage {
    /// Fully in-memory storage with the given question bank.
    #[must_use]
    pub fn in_memory(questions: InMemoryQuestionBank) -> Self {
        let repo = InMemoryRepository::new();
        let sessions: Arc<dyn SessionRepository> = Arc::new(repo.clone());
        let attempts: Arc<dyn AttemptRepository> = Arc::new(repo);
        Self {
            sessions,
            attempts,
            questions: Arc::new(questions),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyq_core::model::SessionStatus;
    use pyq_core::time::fixed_now;

    fn build_session(user: &str, n: usize) -> Session {
        Session::new(
            SessionId::generate(),
            UserId::new(user),
            "Practice",
            SessionFilter::new(),
            (0..n).map(|i| QuestionId::new(format!("q{i}"))).collect(),
            None,
            fixed_now(),
        )
        .unwrap()
    }

    #[test]
    fn only_outages_count_as_unavailable() {
        assert!(StorageError::Connection("refused".into()).is_unavailable());
        assert!(
            StorageError::Timeout {
                op: "get_session",
                after: Duration::from_secs(2)
            }
            .is_unavailable()
        );
        assert!(!StorageError::Serialization("bad json".into()).is_unavailable());
        assert!(!StorageError::Rejected("FOREIGN KEY constraint failed".into()).is_unavailable());
        assert!(!StorageError::Conflict.is_unavailable());
        assert!(!StorageError::NotFound.is_unavailable());
    }

    #[tokio::test]
    async fn invalid_patch_is_rejected() {
        let repo = InMemoryRepository::new();
        let session = build_session("u1", 2);
        repo.insert_session(&session).await.unwrap();
        let err = repo
            .update_session(session.id(), &SessionPatch::cursor(9, fixed_now()))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Rejected(_)));
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_ids() {
        let repo = InMemoryRepository::new();
        let session = build_session("u1", 2);
        repo.insert_session(&session).await.unwrap();
        let err = repo.insert_session(&session).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict));
    }

    #[tokio::test]
    async fn update_applies_patch_and_reports_missing() {
        let repo = InMemoryRepository::new();
        let session = build_session("u1", 3);
        repo.insert_session(&session).await.unwrap();

        let updated = repo
            .update_session(session.id(), &SessionPatch::cursor(2, fixed_now()))
            .await
            .unwrap();
        assert_eq!(updated.current_index(), 2);

        let err = repo
            .update_session(SessionId::generate(), &SessionPatch::touch(fixed_now()))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound));
    }

    #[tokio::test]
    async fn record_attempt_preserves_identity() {
        let repo = InMemoryRepository::new();
        let session = build_session("u1", 1);
        let q = QuestionId::new("q0");

        let first = repo
            .record_attempt(&Attempt::new(session.id(), q.clone(), "A", false, 3, fixed_now()))
            .await
            .unwrap();
        let second = repo
            .record_attempt(&Attempt::new(session.id(), q.clone(), "B", true, 4, fixed_now()))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        let all = repo.attempts_for_session(session.id()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].user_answer, "B");
        assert!(all[0].is_correct);
    }

    #[tokio::test]
    async fn list_filters_by_user_and_status() {
        let repo = InMemoryRepository::new();
        let mut paused = build_session("u1", 1);
        paused.pause(fixed_now()).unwrap();
        repo.insert_session(&paused).await.unwrap();
        repo.insert_session(&build_session("u1", 1)).await.unwrap();
        repo.insert_session(&build_session("u2", 1)).await.unwrap();

        let all = repo
            .list_sessions(&UserId::new("u1"), StatusFilter::All)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let only_paused = repo
            .list_sessions(&UserId::new("u1"), StatusFilter::Only(SessionStatus::Paused))
            .await
            .unwrap();
        assert_eq!(only_paused.len(), 1);
        assert_eq!(only_paused[0].id(), paused.id());
    }

    #[tokio::test]
    async fn solved_questions_span_the_users_sessions() {
        let repo = InMemoryRepository::new();
        let mine = build_session("u1", 2);
        let theirs = build_session("u2", 2);
        repo.insert_session(&mine).await.unwrap();
        repo.insert_session(&theirs).await.unwrap();

        for (s, q, ok) in [(&mine, "q0", true), (&mine, "q1", false), (&theirs, "q1", true)] {
            repo.record_attempt(&Attempt::new(s.id(), QuestionId::new(q), "x", ok, 1, fixed_now()))
                .await
                .unwrap();
        }

        let solved = repo.solved_question_ids(&UserId::new("u1")).await.unwrap();
        assert_eq!(solved, HashSet::from([QuestionId::new("q0")]));
    }

    #[test]
    fn question_snapshot_is_per_session() {
        let repo = InMemoryRepository::new();
        let a = SessionId::generate();
        let b = SessionId::generate();
        let q = Question::new("q1", "?", "A");
        repo.remember_questions(a, std::slice::from_ref(&q)).unwrap();
        assert_eq!(repo.banked_question(a, &q.id).unwrap(), Some(q.clone()));
        assert!(repo.banked_question(b, &q.id).unwrap().is_none());
    }
}
