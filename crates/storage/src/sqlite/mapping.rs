use chrono::{DateTime, SecondsFormat, Utc};
use pyq_core::model::{
    Attempt, PyqMetadata, Question, QuestionId, QuestionScope, ResponseId, Session,
    SessionCounters, SessionFilter, SessionId, SessionStatus, UserId,
};
use pyq_core::time::parse_timestamp;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::repository::StorageError;

pub(crate) fn ser<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Serialization(e.to_string())
}

/// Classify a driver error.
///
/// Only errors that say nothing about the statement itself (I/O, pool,
/// busy/locked database) become `Connection`; constraint violations and
/// decode failures are answers from the store and must not trigger fallback.
pub(crate) fn conn(e: sqlx::Error) -> StorageError {
    match &e {
        sqlx::Error::RowNotFound => StorageError::NotFound,
        sqlx::Error::Database(db) => match db.kind() {
            sqlx::error::ErrorKind::UniqueViolation => StorageError::Conflict,
            sqlx::error::ErrorKind::ForeignKeyViolation
            | sqlx::error::ErrorKind::NotNullViolation
            | sqlx::error::ErrorKind::CheckViolation => {
                StorageError::Rejected(db.message().to_owned())
            }
            _ if is_busy_code(db.code().as_deref()) => StorageError::Connection(e.to_string()),
            _ => StorageError::Rejected(db.message().to_owned()),
        },
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::TypeNotFound { .. } => StorageError::Serialization(e.to_string()),
        _ => StorageError::Connection(e.to_string()),
    }
}

/// `SQLITE_BUSY` (5) and `SQLITE_LOCKED` (6), including extended codes.
fn is_busy_code(code: Option<&str>) -> bool {
    code.and_then(|c| c.parse::<i64>().ok())
        .is_some_and(|c| matches!(c & 0xff, 5 | 6))
}

/// Canonical text form for stored timestamps: UTC, microseconds, `Z` suffix.
pub(crate) fn timestamp_to_text(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn timestamp_column(row: &SqliteRow, column: &'static str) -> Result<DateTime<Utc>, StorageError> {
    let raw: String = row.try_get(column).map_err(ser)?;
    parse_timestamp(&raw)
        .ok_or_else(|| StorageError::Serialization(format!("invalid {column}: {raw}")))
}

fn u32_column(row: &SqliteRow, column: &'static str) -> Result<u32, StorageError> {
    let v: i64 = row.try_get(column).map_err(ser)?;
    u32::try_from(v).map_err(|_| StorageError::Serialization(format!("invalid {column}: {v}")))
}

fn opt_u32_column(row: &SqliteRow, column: &'static str) -> Result<Option<u32>, StorageError> {
    row.try_get::<Option<i64>, _>(column)
        .map_err(ser)?
        .map(|v| {
            u32::try_from(v)
                .map_err(|_| StorageError::Serialization(format!("invalid {column}: {v}")))
        })
        .transpose()
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(ser)
}

fn from_json<T: serde::de::DeserializeOwned>(
    row: &SqliteRow,
    column: &'static str,
) -> Result<T, StorageError> {
    let raw: String = row.try_get(column).map_err(ser)?;
    serde_json::from_str(&raw).map_err(|e| StorageError::Serialization(format!("{column}: {e}")))
}

pub(crate) fn map_session_row(row: &SqliteRow) -> Result<Session, StorageError> {
    let id: SessionId = row
        .try_get::<String, _>("id")
        .map_err(ser)?
        .parse()
        .map_err(ser)?;
    let status: SessionStatus = row
        .try_get::<String, _>("status")
        .map_err(ser)?
        .parse()
        .map_err(ser)?;
    let filter: SessionFilter = from_json(row, "filter_json")?;
    let question_ids: Vec<QuestionId> = from_json(row, "question_ids_json")?;
    let current_index = usize::try_from(row.try_get::<i64, _>("current_index").map_err(ser)?)
        .map_err(|_| StorageError::Serialization("current_index sign overflow".into()))?;

    let counters = SessionCounters {
        answered: u32_column(row, "questions_answered")?,
        correct: u32_column(row, "correct_answers")?,
        incorrect: u32_column(row, "incorrect_answers")?,
    };

    Session::from_persisted(
        id,
        UserId::new(row.try_get::<String, _>("user_id").map_err(ser)?),
        row.try_get("session_name").map_err(ser)?,
        filter,
        question_ids,
        current_index,
        status,
        timestamp_column(row, "start_time")?,
        timestamp_column(row, "last_activity")?,
        opt_u32_column(row, "time_limit_minutes")?,
        counters,
    )
    .map_err(ser)
}

pub(crate) fn map_attempt_row(row: &SqliteRow) -> Result<Attempt, StorageError> {
    let id: ResponseId = row
        .try_get::<String, _>("id")
        .map_err(ser)?
        .parse()
        .map_err(ser)?;
    let session_id: SessionId = row
        .try_get::<String, _>("session_id")
        .map_err(ser)?
        .parse()
        .map_err(ser)?;

    Ok(Attempt {
        id,
        session_id,
        question_id: QuestionId::new(row.try_get::<String, _>("question_id").map_err(ser)?),
        user_answer: row.try_get("user_answer").map_err(ser)?,
        is_correct: row.try_get::<i64, _>("is_correct").map_err(ser)? != 0,
        time_taken_seconds: u32_column(row, "time_taken_seconds")?,
        recorded_at: timestamp_column(row, "recorded_at")?,
    })
}

/// Map a `questions LEFT JOIN pyq_metadata` row.
///
/// A null `question_id` on the metadata side means the question has no PYQ
/// metadata at all.
pub(crate) fn map_question_row(row: &SqliteRow) -> Result<Question, StorageError> {
    let scope = QuestionScope {
        exam_id: row.try_get("exam_id").map_err(ser)?,
        subject_id: row.try_get("subject_id").map_err(ser)?,
        chapter_id: row.try_get("chapter_id").map_err(ser)?,
        topic_id: row.try_get("topic_id").map_err(ser)?,
        concept_id: row.try_get("concept_id").map_err(ser)?,
    };

    let has_metadata = row
        .try_get::<Option<String>, _>("meta_question_id")
        .map_err(ser)?
        .is_some();
    let metadata = if has_metadata {
        let tags_raw: Option<String> = row.try_get("tags_json").map_err(ser)?;
        let tags: Vec<String> = match tags_raw {
            Some(raw) => serde_json::from_str(&raw).map_err(ser)?,
            None => Vec::new(),
        };
        Some(PyqMetadata {
            year: row
                .try_get::<Option<i64>, _>("year")
                .map_err(ser)?
                .map(|y| {
                    i32::try_from(y)
                        .map_err(|_| StorageError::Serialization(format!("invalid year: {y}")))
                })
                .transpose()?,
            exam_session: row.try_get("exam_session").map_err(ser)?,
            paper_code: row.try_get("paper_code").map_err(ser)?,
            question_number: row.try_get("question_number").map_err(ser)?,
            marks_allocated: row.try_get("marks_allocated").map_err(ser)?,
            time_allocated_minutes: opt_u32_column(row, "time_allocated_minutes")?,
            solution: row.try_get("solution").map_err(ser)?,
            source: row.try_get("source").map_err(ser)?,
            tags,
            difficulty_level: row.try_get("difficulty_level").map_err(ser)?,
            question_type: row.try_get("question_type").map_err(ser)?,
        })
    } else {
        None
    };

    Ok(Question {
        id: QuestionId::new(row.try_get::<String, _>("id").map_err(ser)?),
        content: row.try_get("content").map_err(ser)?,
        options: from_json(row, "options_json")?,
        correct_answer: row.try_get("correct_answer").map_err(ser)?,
        scope,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyq_core::time::fixed_now;

    #[test]
    fn stored_timestamps_parse_back_exactly() {
        let text = timestamp_to_text(fixed_now());
        assert_eq!(text, "2023-11-14T22:13:20.000000Z");
        assert_eq!(parse_timestamp(&text), Some(fixed_now()));
    }

    #[test]
    fn busy_and_locked_codes_are_transient() {
        assert!(is_busy_code(Some("5")));
        assert!(is_busy_code(Some("517")));
        assert!(is_busy_code(Some("6")));
        assert!(!is_busy_code(Some("787")));
        assert!(!is_busy_code(Some("2067")));
        assert!(!is_busy_code(None));
    }

    #[test]
    fn pool_failures_stay_unavailable() {
        assert!(conn(sqlx::Error::PoolTimedOut).is_unavailable());
        assert!(conn(sqlx::Error::PoolClosed).is_unavailable());
        assert!(matches!(conn(sqlx::Error::RowNotFound), StorageError::NotFound));
    }
}
