use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{QuestionId, ResponseId, SessionId};

/// One graded submission for a question within a session.
///
/// At most one exists per `(session_id, question_id)`; a re-submission
/// overwrites the fields but keeps `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub id: ResponseId,
    pub session_id: SessionId,
    pub question_id: QuestionId,
    pub user_answer: String,
    pub is_correct: bool,
    pub time_taken_seconds: u32,
    pub recorded_at: DateTime<Utc>,
}

impl Attempt {
    /// A new attempt with a freshly generated response id.
    #[must_use]
    pub fn new(
        session_id: SessionId,
        question_id: QuestionId,
        user_answer: impl Into<String>,
        is_correct: bool,
        time_taken_seconds: u32,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ResponseId::generate(),
            session_id,
            question_id,
            user_answer: user_answer.into(),
            is_correct,
            time_taken_seconds,
            recorded_at,
        }
    }

    /// Overwrite this attempt with a newer submission, preserving its identity.
    #[must_use]
    pub fn superseded_by(&self, newer: Attempt) -> Attempt {
        Attempt {
            id: self.id,
            ..newer
        }
    }
}

/// Per-position status in a progress report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionStatus {
    NotAttempted,
    Correct,
    Incorrect,
}
