use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::model::{Attempt, QuestionId, SessionFilter, SessionId, UserId};

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

/// Rejected lifecycle transitions and construction errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionStateError {
    #[error("a session needs at least one question")]
    NoQuestions,

    #[error("duplicate question in sequence: {0}")]
    DuplicateQuestion(QuestionId),

    #[error("cannot {action} a session that is {status}")]
    InvalidTransition {
        action: &'static str,
        status: SessionStatus,
    },

    #[error("session is {0} and no longer accepts changes")]
    Closed(SessionStatus),
}

/// Persisted data that violates session invariants.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PersistedStateError {
    #[error("current index {index} exceeds question count {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("invalid session status: {0}")]
    InvalidStatus(String),
}

//
// ─── STATUS ────────────────────────────────────────────────────────────────────
//

/// Lifecycle state of a session.
///
/// `Active ⇄ Paused`, `Active/Paused → Completed`, `Active/Paused → Expired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Expired,
}

impl SessionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Expired => "expired",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Expired)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = PersistedStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(SessionStatus::Active),
            "paused" => Ok(SessionStatus::Paused),
            "completed" => Ok(SessionStatus::Completed),
            "expired" => Ok(SessionStatus::Expired),
            _ => Err(PersistedStateError::InvalidStatus(s.to_owned())),
        }
    }
}

/// Status criterion for listing a user's sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusFilter {
    #[default]
    All,
    Only(SessionStatus),
}

impl StatusFilter {
    #[must_use]
    pub fn matches(self, status: SessionStatus) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Only(wanted) => wanted == status,
        }
    }
}

impl FromStr for StatusFilter {
    type Err = PersistedStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("all") {
            return Ok(StatusFilter::All);
        }
        s.parse().map(StatusFilter::Only)
    }
}

//
// ─── COUNTERS ──────────────────────────────────────────────────────────────────
//

/// Cached answer counters stored alongside a session.
///
/// Always rebuilt from the full attempt set; never incremented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionCounters {
    pub answered: u32,
    pub correct: u32,
    pub incorrect: u32,
}

impl SessionCounters {
    /// Recount from attempts, considering only questions that belong to `question_ids`.
    #[must_use]
    pub fn from_attempts(question_ids: &[QuestionId], attempts: &[Attempt]) -> Self {
        let mut counters = Self::default();
        for attempt in attempts {
            if !question_ids.contains(&attempt.question_id) {
                continue;
            }
            counters.answered = counters.answered.saturating_add(1);
            if attempt.is_correct {
                counters.correct = counters.correct.saturating_add(1);
            } else {
                counters.incorrect = counters.incorrect.saturating_add(1);
            }
        }
        counters
    }
}

//
// ─── PATCH ─────────────────────────────────────────────────────────────────────
//

/// Partial update applied to a stored session.
///
/// `question_ids`, `filter` and identity fields are deliberately absent: they are
/// frozen at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPatch {
    pub current_index: Option<usize>,
    pub status: Option<SessionStatus>,
    pub counters: Option<SessionCounters>,
    pub last_activity: DateTime<Utc>,
}

impl SessionPatch {
    /// Only refresh the activity timestamp.
    #[must_use]
    pub fn touch(at: DateTime<Utc>) -> Self {
        Self {
            current_index: None,
            status: None,
            counters: None,
            last_activity: at,
        }
    }

    #[must_use]
    pub fn cursor(index: usize, at: DateTime<Utc>) -> Self {
        Self {
            current_index: Some(index),
            ..Self::touch(at)
        }
    }

    #[must_use]
    pub fn status(status: SessionStatus, at: DateTime<Utc>) -> Self {
        Self {
            status: Some(status),
            ..Self::touch(at)
        }
    }

    #[must_use]
    pub fn with_counters(mut self, counters: SessionCounters) -> Self {
        self.counters = Some(counters);
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }
}

//
// ─── SESSION ───────────────────────────────────────────────────────────────────
//

/// One user's ordered run through a filtered question set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    id: SessionId,
    user_id: UserId,
    name: String,
    filter: SessionFilter,
    question_ids: Vec<QuestionId>,
    current_index: usize,
    status: SessionStatus,
    start_time: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    time_limit_minutes: Option<u32>,
    counters: SessionCounters,
}

impl Session {
    /// Create a fresh `Active` session positioned on its first question.
    ///
    /// # Errors
    ///
    /// Returns `SessionStateError::NoQuestions` for an empty sequence and
    /// `SessionStateError::DuplicateQuestion` if an id occurs twice.
    pub fn new(
        id: SessionId,
        user_id: UserId,
        name: impl Into<String>,
        filter: SessionFilter,
        question_ids: Vec<QuestionId>,
        time_limit_minutes: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<Self, SessionStateError> {
        if question_ids.is_empty() {
            return Err(SessionStateError::NoQuestions);
        }
        let mut seen = std::collections::HashSet::with_capacity(question_ids.len());
        for id in &question_ids {
            if !seen.insert(id) {
                return Err(SessionStateError::DuplicateQuestion(id.clone()));
            }
        }

        Ok(Self {
            id,
            user_id,
            name: name.into(),
            filter,
            question_ids,
            current_index: 0,
            status: SessionStatus::Active,
            start_time: now,
            last_activity: now,
            time_limit_minutes,
            counters: SessionCounters::default(),
        })
    }

    /// Rehydrate a session from persisted storage.
    ///
    /// # Errors
    ///
    /// Returns `PersistedStateError::IndexOutOfBounds` if the cursor lies past the sequence.
    #[allow(clippy::too_many_arguments)]
    pub fn from_persisted(
        id: SessionId,
        user_id: UserId,
        name: String,
        filter: SessionFilter,
        question_ids: Vec<QuestionId>,
        current_index: usize,
        status: SessionStatus,
        start_time: DateTime<Utc>,
        last_activity: DateTime<Utc>,
        time_limit_minutes: Option<u32>,
        counters: SessionCounters,
    ) -> Result<Self, PersistedStateError> {
        if current_index > question_ids.len() {
            return Err(PersistedStateError::IndexOutOfBounds {
                index: current_index,
                len: question_ids.len(),
            });
        }
        Ok(Self {
            id,
            user_id,
            name,
            filter,
            question_ids,
            current_index,
            status,
            start_time,
            last_activity,
            time_limit_minutes,
            counters,
        })
    }

    /// Same session state under a different identity.
    #[must_use]
    pub fn with_id(mut self, id: SessionId) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn filter(&self) -> &SessionFilter {
        &self.filter
    }

    #[must_use]
    pub fn question_ids(&self) -> &[QuestionId] {
        &self.question_ids
    }

    #[must_use]
    pub fn total_questions(&self) -> usize {
        self.question_ids.len()
    }

    #[must_use]
    pub fn current_index(&self) -> usize {
        self.current_index
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    #[must_use]
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    #[must_use]
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    #[must_use]
    pub fn time_limit_minutes(&self) -> Option<u32> {
        self.time_limit_minutes
    }

    #[must_use]
    pub fn counters(&self) -> SessionCounters {
        self.counters
    }

    /// Wall-clock deadline implied by the time limit, if one was set.
    ///
    /// Expiry itself is enforced outside the engine.
    #[must_use]
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.time_limit_minutes
            .map(|m| self.start_time + Duration::minutes(i64::from(m)))
    }

    #[must_use]
    pub fn contains_question(&self, question_id: &QuestionId) -> bool {
        self.question_ids.contains(question_id)
    }

    /// Position of a question in the frozen sequence.
    #[must_use]
    pub fn position_of(&self, question_id: &QuestionId) -> Option<usize> {
        self.question_ids.iter().position(|q| q == question_id)
    }

    /// Fails when the session can no longer be navigated or answered.
    ///
    /// # Errors
    ///
    /// Returns `SessionStateError::Closed` for expired sessions.
    pub fn ensure_open(&self) -> Result<(), SessionStateError> {
        if self.status == SessionStatus::Expired {
            return Err(SessionStateError::Closed(self.status));
        }
        Ok(())
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
    }

    pub(crate) fn set_current_index(&mut self, index: usize, now: DateTime<Utc>) {
        debug_assert!(index <= self.question_ids.len());
        self.current_index = index;
        self.last_activity = now;
    }

    /// `Active → Paused`.
    ///
    /// # Errors
    ///
    /// Returns `SessionStateError::InvalidTransition` from any other state.
    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<(), SessionStateError> {
        self.transition("pause", &[SessionStatus::Active], SessionStatus::Paused, now)
    }

    /// `Paused → Active`.
    ///
    /// # Errors
    ///
    /// Returns `SessionStateError::InvalidTransition` from any other state.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<(), SessionStateError> {
        self.transition("resume", &[SessionStatus::Paused], SessionStatus::Active, now)
    }

    /// `Active/Paused → Completed`.
    ///
    /// # Errors
    ///
    /// Returns `SessionStateError::InvalidTransition` from a terminal state.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), SessionStateError> {
        self.transition(
            "complete",
            &[SessionStatus::Active, SessionStatus::Paused],
            SessionStatus::Completed,
            now,
        )
    }

    /// `Active/Paused → Expired`.
    ///
    /// # Errors
    ///
    /// Returns `SessionStateError::InvalidTransition` from a terminal state.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Result<(), SessionStateError> {
        self.transition(
            "expire",
            &[SessionStatus::Active, SessionStatus::Paused],
            SessionStatus::Expired,
            now,
        )
    }

    fn transition(
        &mut self,
        action: &'static str,
        from: &[SessionStatus],
        to: SessionStatus,
        now: DateTime<Utc>,
    ) -> Result<(), SessionStateError> {
        if !from.contains(&self.status) {
            return Err(SessionStateError::InvalidTransition {
                action,
                status: self.status,
            });
        }
        self.status = to;
        self.last_activity = now;
        Ok(())
    }

    /// Replace cached counters with a recount of `attempts`.
    ///
    /// Returns the new counters. Moves a non-terminal session to `Completed`
    /// once every question has an attempt.
    pub fn recount(&mut self, attempts: &[Attempt], now: DateTime<Utc>) -> SessionCounters {
        self.counters = SessionCounters::from_attempts(&self.question_ids, attempts);
        self.last_activity = now;
        let all_answered = self.counters.answered as usize == self.question_ids.len();
        if all_answered && !self.status.is_terminal() {
            self.status = SessionStatus::Completed;
        }
        self.counters
    }

    /// Apply a stored patch to this in-memory copy.
    ///
    /// # Errors
    ///
    /// Returns `PersistedStateError::IndexOutOfBounds` if the patched cursor is invalid.
    pub fn apply_patch(&mut self, patch: &SessionPatch) -> Result<(), PersistedStateError> {
        if let Some(index) = patch.current_index {
            if index > self.question_ids.len() {
                return Err(PersistedStateError::IndexOutOfBounds {
                    index,
                    len: self.question_ids.len(),
                });
            }
            self.current_index = index;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(counters) = patch.counters {
            self.counters = counters;
        }
        self.last_activity = patch.last_activity;
        Ok(())
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//
