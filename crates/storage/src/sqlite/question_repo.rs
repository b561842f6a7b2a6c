use pyq_core::model::{Question, QuestionId, SessionFilter};

use super::SqliteRepository;
use super::mapping::{conn, map_question_row, to_json};
use crate::repository::{QuestionSource, QuestionSourceError, StorageError};

const QUESTION_SELECT: &str = r"
    SELECT q.id, q.content, q.options_json, q.correct_answer,
           q.exam_id, q.subject_id, q.chapter_id, q.topic_id, q.concept_id,
           m.question_id AS meta_question_id, m.year, m.exam_session, m.paper_code,
           m.question_number, m.marks_allocated, m.time_allocated_minutes, m.solution,
           m.source, m.tags_json, m.difficulty_level, m.question_type
    FROM questions q
    LEFT JOIN pyq_metadata m ON m.question_id = q.id
";

fn unavailable(e: sqlx::Error) -> QuestionSourceError {
    QuestionSourceError::Unavailable(e.to_string())
}

fn malformed(e: StorageError) -> QuestionSourceError {
    QuestionSourceError::Malformed(e.to_string())
}

impl SqliteRepository {
    /// Insert or replace a catalog question together with its PYQ metadata.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the question cannot be written.
    pub async fn upsert_question(&self, question: &Question) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(conn)?;

        sqlx::query(
            r"
            INSERT INTO questions (id, content, options_json, correct_answer,
                                   exam_id, subject_id, chapter_id, topic_id, concept_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                content = excluded.content,
                options_json = excluded.options_json,
                correct_answer = excluded.correct_answer,
                exam_id = excluded.exam_id,
                subject_id = excluded.subject_id,
                chapter_id = excluded.chapter_id,
                topic_id = excluded.topic_id,
                concept_id = excluded.concept_id
            ",
        )
        .bind(question.id.as_str())
        .bind(question.content.as_str())
        .bind(to_json(&question.options)?)
        .bind(question.correct_answer.as_str())
        .bind(question.scope.exam_id.as_deref())
        .bind(question.scope.subject_id.as_deref())
        .bind(question.scope.chapter_id.as_deref())
        .bind(question.scope.topic_id.as_deref())
        .bind(question.scope.concept_id.as_deref())
        .execute(&mut *tx)
        .await
        .map_err(conn)?;

        sqlx::query("DELETE FROM pyq_metadata WHERE question_id = ?1")
            .bind(question.id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(conn)?;

        if let Some(meta) = &question.metadata {
            sqlx::query(
                r"
                INSERT INTO pyq_metadata (question_id, year, exam_session, paper_code,
                                          question_number, marks_allocated, time_allocated_minutes,
                                          solution, source, tags_json, difficulty_level, question_type)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                ",
            )
            .bind(question.id.as_str())
            .bind(meta.year)
            .bind(meta.exam_session.as_deref())
            .bind(meta.paper_code.as_deref())
            .bind(meta.question_number.as_deref())
            .bind(meta.marks_allocated)
            .bind(meta.time_allocated_minutes.map(i64::from))
            .bind(meta.solution.as_deref())
            .bind(meta.source.as_deref())
            .bind(to_json(&meta.tags)?)
            .bind(meta.difficulty_level.as_deref())
            .bind(meta.question_type.as_deref())
            .execute(&mut *tx)
            .await
            .map_err(conn)?;
        }

        tx.commit().await.map_err(conn)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl QuestionSource for SqliteRepository {
    async fn resolve(&self, filter: &SessionFilter) -> Result<Vec<Question>, QuestionSourceError> {
        // Hierarchy ids narrow the scan in SQL; metadata criteria run on the mapped rows.
        let scope = [
            ("q.exam_id", &filter.exam_id),
            ("q.subject_id", &filter.subject_id),
            ("q.chapter_id", &filter.chapter_id),
            ("q.topic_id", &filter.topic_id),
            ("q.concept_id", &filter.concept_id),
        ];

        let mut sql = QUESTION_SELECT.to_string();
        let mut binds: Vec<&str> = Vec::new();
        for (column, value) in scope {
            if let Some(value) = value {
                sql.push_str(if binds.is_empty() { " WHERE " } else { " AND " });
                binds.push(value.as_str());
                sql.push_str(&format!("{column} = ?{}", binds.len()));
            }
        }
        sql.push_str(" ORDER BY q.rowid ASC");

        let mut q = sqlx::query(&sql);
        for value in binds {
            q = q.bind(value);
        }
        let rows = q.fetch_all(&self.pool).await.map_err(unavailable)?;

        let mut out = Vec::new();
        for row in &rows {
            let question = map_question_row(row).map_err(malformed)?;
            if filter.matches_metadata(&question) {
                out.push(question);
            }
        }
        Ok(out)
    }

    async fn get_question(&self, id: &QuestionId) -> Result<Option<Question>, QuestionSourceError> {
        let sql = format!("{QUESTION_SELECT} WHERE q.id = ?1");
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;

        row.as_ref()
            .map(map_question_row)
            .transpose()
            .map_err(malformed)
    }
}
