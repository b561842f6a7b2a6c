use chrono::{DateTime, Utc};
use serde::Serialize;

use pyq_core::model::{
    Attempt, PyqMetadata, Question, QuestionId, ResponseId, Session, SessionId, SessionStatus,
};
use pyq_core::progress::percentage;
use pyq_core::sequencer::boundaries;

//
// ─── CURRENT QUESTION ──────────────────────────────────────────────────────────
//

/// Cursor position and boundary flags.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NavState {
    pub current_index: usize,
    pub total_questions: usize,
    pub questions_answered: usize,
    /// Position-based: `current_index / total_questions * 100`.
    pub progress_percentage: f64,
    pub has_previous: bool,
    pub has_next: bool,
    pub is_last: bool,
}

impl NavState {
    #[must_use]
    pub fn of(session: &Session) -> Self {
        let b = boundaries(session);
        Self {
            current_index: session.current_index(),
            total_questions: session.total_questions(),
            questions_answered: session.counters().answered as usize,
            progress_percentage: percentage(session.current_index(), session.total_questions()),
            has_previous: b.has_previous,
            has_next: b.has_next,
            is_last: b.is_last,
        }
    }
}

/// A question as shown to the learner: no answer key, no solution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuestionView {
    pub id: QuestionId,
    pub content: String,
    pub options: Vec<String>,
    pub metadata: Option<PyqMetadata>,
}

impl From<Question> for QuestionView {
    fn from(q: Question) -> Self {
        Self {
            id: q.id,
            content: q.content,
            options: q.options,
            metadata: q.metadata.map(|m| PyqMetadata {
                solution: None,
                ..m
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionedQuestion {
    pub question: QuestionView,
    pub nav: NavState,
    /// The learner's earlier attempt at this question, if any.
    pub previous_attempt: Option<Attempt>,
    pub deadline: Option<DateTime<Utc>>,
}

/// Result of `GetCurrent`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CurrentQuestion {
    At(Box<PositionedQuestion>),
    NoneLeft {
        nav: NavState,
        session_completed: bool,
    },
}

//
// ─── GRADE ─────────────────────────────────────────────────────────────────────
//

/// Result of `SubmitAnswer`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Grade {
    pub is_correct: bool,
    pub correct_answer: String,
    /// Worked solution, empty when the question has none.
    pub explanation: String,
    pub response_id: ResponseId,
    pub session_status: SessionStatus,
}

//
// ─── SUMMARY ───────────────────────────────────────────────────────────────────
//

/// One row of `ListSessions`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub session_name: String,
    pub status: SessionStatus,
    pub total_questions: usize,
    pub questions_answered: usize,
    pub questions_correct: usize,
    pub progress_percentage: f64,
    pub is_completed: bool,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub fallback: bool,
}

impl SessionSummary {
    #[must_use]
    pub fn from_session(session: &Session, fallback: bool) -> Self {
        let counters = session.counters();
        let answered = counters.answered as usize;
        let total = session.total_questions();
        Self {
            session_id: session.id(),
            session_name: session.name().to_owned(),
            status: session.status(),
            total_questions: total,
            questions_answered: answered,
            questions_correct: counters.correct as usize,
            progress_percentage: percentage(answered, total),
            is_completed: session.status() == SessionStatus::Completed || answered == total,
            start_time: session.start_time(),
            last_activity: session.last_activity(),
            fallback,
        }
    }
}
