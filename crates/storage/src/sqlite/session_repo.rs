use pyq_core::model::{Session, SessionId, SessionPatch, StatusFilter, UserId};

use super::SqliteRepository;
use super::mapping::{conn, map_session_row, timestamp_to_text, to_json};
use crate::repository::{SessionRepository, StorageError};

const SESSION_COLUMNS: &str = r"
    id, user_id, session_name, filter_json, question_ids_json, current_index, status,
    start_time, last_activity, time_limit_minutes,
    questions_answered, correct_answers, incorrect_answers
";

/// Column values for one session row, in `SESSION_COLUMNS` order.
struct SessionRow {
    id: String,
    user_id: String,
    name: String,
    filter_json: String,
    question_ids_json: String,
    current_index: i64,
    status: &'static str,
    start_time: String,
    last_activity: String,
    time_limit_minutes: Option<i64>,
    answered: i64,
    correct: i64,
    incorrect: i64,
}

impl SessionRow {
    fn from_session(session: &Session) -> Result<Self, StorageError> {
        let counters = session.counters();
        Ok(Self {
            id: session.id().to_string(),
            user_id: session.user_id().to_string(),
            name: session.name().to_owned(),
            filter_json: to_json(session.filter())?,
            question_ids_json: to_json(&session.question_ids())?,
            current_index: i64::try_from(session.current_index())
                .map_err(|_| StorageError::Serialization("current_index overflow".into()))?,
            status: session.status().as_str(),
            start_time: timestamp_to_text(session.start_time()),
            last_activity: timestamp_to_text(session.last_activity()),
            time_limit_minutes: session.time_limit_minutes().map(i64::from),
            answered: i64::from(counters.answered),
            correct: i64::from(counters.correct),
            incorrect: i64::from(counters.incorrect),
        })
    }
}

impl SqliteRepository {
    async fn write_session(&self, session: &Session, upsert: bool) -> Result<u64, StorageError> {
        let row = SessionRow::from_session(session)?;
        let on_conflict = if upsert {
            r"
            ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                session_name = excluded.session_name,
                filter_json = excluded.filter_json,
                question_ids_json = excluded.question_ids_json,
                current_index = excluded.current_index,
                status = excluded.status,
                start_time = excluded.start_time,
                last_activity = excluded.last_activity,
                time_limit_minutes = excluded.time_limit_minutes,
                questions_answered = excluded.questions_answered,
                correct_answers = excluded.correct_answers,
                incorrect_answers = excluded.incorrect_answers
            "
        } else {
            "ON CONFLICT(id) DO NOTHING"
        };
        let sql = format!(
            "INSERT INTO practice_sessions ({SESSION_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             {on_conflict}"
        );

        let res = sqlx::query(&sql)
            .bind(row.id)
            .bind(row.user_id)
            .bind(row.name)
            .bind(row.filter_json)
            .bind(row.question_ids_json)
            .bind(row.current_index)
            .bind(row.status)
            .bind(row.start_time)
            .bind(row.last_activity)
            .bind(row.time_limit_minutes)
            .bind(row.answered)
            .bind(row.correct)
            .bind(row.incorrect)
            .execute(&self.pool)
            .await
            .map_err(conn)?;
        Ok(res.rows_affected())
    }
}

#[async_trait::async_trait]
impl SessionRepository for SqliteRepository {
    async fn insert_session(&self, session: &Session) -> Result<(), StorageError> {
        if self.write_session(session, false).await? == 0 {
            return Err(StorageError::Conflict);
        }
        Ok(())
    }

    async fn save_session(&self, session: &Session) -> Result<(), StorageError> {
        self.write_session(session, true).await.map(|_| ())
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>, StorageError> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM practice_sessions WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(conn)?;

        row.as_ref().map(map_session_row).transpose()
    }

    async fn update_session(
        &self,
        id: SessionId,
        patch: &SessionPatch,
    ) -> Result<Session, StorageError> {
        let mut session = self.get_session(id).await?.ok_or(StorageError::NotFound)?;
        session
            .apply_patch(patch)
            .map_err(|e| StorageError::Rejected(e.to_string()))?;

        let mut sets: Vec<String> = vec!["last_activity = ?1".into()];
        let mut next = 2;
        let mut push = |column: &str, sets: &mut Vec<String>| {
            sets.push(format!("{column} = ?{next}"));
            next += 1;
        };

        if patch.current_index.is_some() {
            push("current_index", &mut sets);
        }
        if patch.status.is_some() {
            push("status", &mut sets);
        }
        if patch.counters.is_some() {
            push("questions_answered", &mut sets);
            push("correct_answers", &mut sets);
            push("incorrect_answers", &mut sets);
        }
        let id_param = next;
        let sql = format!(
            "UPDATE practice_sessions SET {} WHERE id = ?{id_param}",
            sets.join(", ")
        );

        let mut q = sqlx::query(&sql).bind(timestamp_to_text(patch.last_activity));
        if let Some(index) = patch.current_index {
            q = q.bind(
                i64::try_from(index)
                    .map_err(|_| StorageError::Serialization("current_index overflow".into()))?,
            );
        }
        if let Some(status) = patch.status {
            q = q.bind(status.as_str());
        }
        if let Some(counters) = patch.counters {
            q = q
                .bind(i64::from(counters.answered))
                .bind(i64::from(counters.correct))
                .bind(i64::from(counters.incorrect));
        }

        let res = q
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(conn)?;
        if res.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(session)
    }

    async fn list_sessions(
        &self,
        user_id: &UserId,
        status: StatusFilter,
    ) -> Result<Vec<Session>, StorageError> {
        let mut sql = format!("SELECT {SESSION_COLUMNS} FROM practice_sessions WHERE user_id = ?1");
        if matches!(status, StatusFilter::Only(_)) {
            sql.push_str(" AND status = ?2");
        }
        sql.push_str(" ORDER BY start_time DESC, rowid DESC");

        let mut q = sqlx::query(&sql).bind(user_id.as_str());
        if let StatusFilter::Only(wanted) = status {
            q = q.bind(wanted.as_str());
        }
        let rows = q.fetch_all(&self.pool).await.map_err(conn)?;

        let mut sessions = Vec::with_capacity(rows.len());
        for row in &rows {
            sessions.push(map_session_row(row)?);
        }
        Ok(sessions)
    }
}
