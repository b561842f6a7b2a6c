use std::collections::HashSet;

use pyq_core::model::{Attempt, QuestionId, SessionId, UserId};

use super::SqliteRepository;
use super::mapping::{conn, map_attempt_row, timestamp_to_text};
use crate::repository::{AttemptRepository, StorageError};

const ATTEMPT_COLUMNS: &str =
    "id, session_id, question_id, user_answer, is_correct, time_taken_seconds, recorded_at";

impl SqliteRepository {
    /// Upsert on `(session_id, question_id)`; `replace_id` decides whether the
    /// stored response id is overwritten too.
    async fn write_attempt(&self, attempt: &Attempt, replace_id: bool) -> Result<(), StorageError> {
        let id_update = if replace_id { "id = excluded.id," } else { "" };
        let sql = format!(
            "INSERT INTO practice_attempts ({ATTEMPT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(session_id, question_id) DO UPDATE SET
                 {id_update}
                 user_answer = excluded.user_answer,
                 is_correct = excluded.is_correct,
                 time_taken_seconds = excluded.time_taken_seconds,
                 recorded_at = excluded.recorded_at"
        );

        sqlx::query(&sql)
            .bind(attempt.id.to_string())
            .bind(attempt.session_id.to_string())
            .bind(attempt.question_id.as_str())
            .bind(attempt.user_answer.as_str())
            .bind(i64::from(attempt.is_correct))
            .bind(i64::from(attempt.time_taken_seconds))
            .bind(timestamp_to_text(attempt.recorded_at))
            .execute(&self.pool)
            .await
            .map_err(conn)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl AttemptRepository for SqliteRepository {
    async fn record_attempt(&self, attempt: &Attempt) -> Result<Attempt, StorageError> {
        self.write_attempt(attempt, false).await?;
        self.attempt_for_question(attempt.session_id, &attempt.question_id)
            .await?
            .ok_or(StorageError::NotFound)
    }

    async fn save_attempt(&self, attempt: &Attempt) -> Result<(), StorageError> {
        self.write_attempt(attempt, true).await
    }

    async fn attempts_for_session(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<Attempt>, StorageError> {
        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM practice_attempts
             WHERE session_id = ?1
             ORDER BY recorded_at ASC, rowid ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(session_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(conn)?;

        let mut attempts = Vec::with_capacity(rows.len());
        for row in &rows {
            attempts.push(map_attempt_row(row)?);
        }
        Ok(attempts)
    }

    async fn attempt_for_question(
        &self,
        session_id: SessionId,
        question_id: &QuestionId,
    ) -> Result<Option<Attempt>, StorageError> {
        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM practice_attempts
             WHERE session_id = ?1 AND question_id = ?2"
        );
        let row = sqlx::query(&sql)
            .bind(session_id.to_string())
            .bind(question_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(conn)?;

        row.as_ref().map(map_attempt_row).transpose()
    }

    async fn solved_question_ids(
        &self,
        user_id: &UserId,
    ) -> Result<HashSet<QuestionId>, StorageError> {
        let ids: Vec<String> = sqlx::query_scalar(
            r"
            SELECT DISTINCT a.question_id
            FROM practice_attempts a
            JOIN practice_sessions s ON s.id = a.session_id
            WHERE s.user_id = ?1 AND a.is_correct = 1
            ",
        )
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(conn)?;

        Ok(ids.into_iter().map(QuestionId::new).collect())
    }
}
