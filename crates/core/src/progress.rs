use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::model::{Attempt, QuestionId, QuestionStatus, Session, SessionId};
use crate::time::elapsed_seconds;

/// Completion, accuracy and timing statistics for one session.
///
/// Every figure is derived from the attempt set and the session record at the
/// time of the call; nothing here is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub session_id: SessionId,
    pub session_name: String,
    /// 1-based position of the cursor.
    pub current_question: usize,
    pub total_questions: usize,
    pub questions_answered: usize,
    pub questions_correct: usize,
    pub questions_incorrect: usize,
    pub questions_remaining: usize,
    pub progress_percentage: f64,
    pub accuracy_percentage: f64,
    pub total_time_seconds: u64,
    pub average_time_per_question: f64,
    pub session_duration_seconds: f64,
    /// Status per position in the session's question sequence.
    pub question_status: Vec<QuestionStatus>,
    pub is_completed: bool,
}

impl ProgressReport {
    /// Aggregate a report from the session and its attempts.
    ///
    /// Attempts for questions outside the session are ignored; if several
    /// attempts exist for one question the most recently recorded wins.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn compute(session: &Session, attempts: &[Attempt], now: DateTime<Utc>) -> Self {
        let mut latest: HashMap<&QuestionId, &Attempt> = HashMap::with_capacity(attempts.len());
        for attempt in attempts {
            if !session.contains_question(&attempt.question_id) {
                continue;
            }
            latest
                .entry(&attempt.question_id)
                .and_modify(|cur| {
                    if attempt.recorded_at >= cur.recorded_at {
                        *cur = attempt;
                    }
                })
                .or_insert(attempt);
        }

        let total = session.total_questions();
        let answered = latest.len();
        let correct = latest.values().filter(|a| a.is_correct).count();
        let incorrect = answered - correct;
        let total_time: u64 = latest
            .values()
            .map(|a| u64::from(a.time_taken_seconds))
            .sum();

        let question_status = session
            .question_ids()
            .iter()
            .map(|q| match latest.get(q) {
                None => QuestionStatus::NotAttempted,
                Some(a) if a.is_correct => QuestionStatus::Correct,
                Some(_) => QuestionStatus::Incorrect,
            })
            .collect();

        Self {
            session_id: session.id(),
            session_name: session.name().to_owned(),
            current_question: session.current_index().min(total.saturating_sub(1)) + 1,
            total_questions: total,
            questions_answered: answered,
            questions_correct: correct,
            questions_incorrect: incorrect,
            questions_remaining: total.saturating_sub(answered),
            progress_percentage: percentage(answered, total),
            accuracy_percentage: percentage(correct, answered),
            total_time_seconds: total_time,
            average_time_per_question: if answered == 0 {
                0.0
            } else {
                total_time as f64 / answered as f64
            },
            session_duration_seconds: elapsed_seconds(session.start_time(), now),
            question_status,
            is_completed: answered == total,
        }
    }
}

/// `part / whole * 100`, clamped to `[0, 100]`, and `0` for an empty whole.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 100.0).clamp(0.0, 100.0)
}
