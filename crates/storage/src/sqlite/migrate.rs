use chrono::Utc;
use sqlx::SqlitePool;

use super::SqliteInitError;

const SCHEMA_V1: &[&str] = &[
    r"
        CREATE TABLE IF NOT EXISTS questions (
            id TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            options_json TEXT NOT NULL DEFAULT '[]',
            correct_answer TEXT NOT NULL,
            exam_id TEXT,
            subject_id TEXT,
            chapter_id TEXT,
            topic_id TEXT,
            concept_id TEXT
        );
    ",
    r"
        CREATE TABLE IF NOT EXISTS pyq_metadata (
            question_id TEXT PRIMARY KEY,
            year INTEGER,
            exam_session TEXT,
            paper_code TEXT,
            question_number TEXT,
            marks_allocated REAL,
            time_allocated_minutes INTEGER CHECK (time_allocated_minutes >= 0),
            solution TEXT,
            source TEXT,
            tags_json TEXT NOT NULL DEFAULT '[]',
            difficulty_level TEXT,
            question_type TEXT,
            FOREIGN KEY (question_id) REFERENCES questions(id) ON DELETE CASCADE
        );
    ",
    r"
        CREATE TABLE IF NOT EXISTS practice_sessions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            session_name TEXT NOT NULL,
            filter_json TEXT NOT NULL,
            question_ids_json TEXT NOT NULL,
            current_index INTEGER NOT NULL CHECK (current_index >= 0),
            status TEXT NOT NULL,
            start_time TEXT NOT NULL,
            last_activity TEXT NOT NULL,
            time_limit_minutes INTEGER CHECK (time_limit_minutes >= 0),
            questions_answered INTEGER NOT NULL DEFAULT 0 CHECK (questions_answered >= 0),
            correct_answers INTEGER NOT NULL DEFAULT 0 CHECK (correct_answers >= 0),
            incorrect_answers INTEGER NOT NULL DEFAULT 0 CHECK (incorrect_answers >= 0)
        );
    ",
    r"
        CREATE TABLE IF NOT EXISTS practice_attempts (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            question_id TEXT NOT NULL,
            user_answer TEXT NOT NULL,
            is_correct INTEGER NOT NULL CHECK (is_correct IN (0, 1)),
            time_taken_seconds INTEGER NOT NULL CHECK (time_taken_seconds >= 0),
            recorded_at TEXT NOT NULL,
            UNIQUE (session_id, question_id),
            FOREIGN KEY (session_id) REFERENCES practice_sessions(id) ON DELETE CASCADE
        );
    ",
    r"
        CREATE INDEX IF NOT EXISTS idx_questions_scope
            ON questions (exam_id, subject_id, chapter_id, topic_id, concept_id);
    ",
    r"
        CREATE INDEX IF NOT EXISTS idx_sessions_user_start
            ON practice_sessions (user_id, start_time);
    ",
    r"
        CREATE INDEX IF NOT EXISTS idx_attempts_session_recorded
            ON practice_attempts (session_id, recorded_at);
    ",
];

/// Runs the versioned schema migrations.
///
/// Version 1 creates the question catalog (questions with PYQ metadata) and
/// the practice tables (sessions, attempts) with their indexes.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), SqliteInitError> {
    async fn is_applied(pool: &SqlitePool, version: i64) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT 1 FROM schema_migrations WHERE version = ?1")
            .bind(version)
            .fetch_optional(pool)
            .await?;
        Ok(row.is_some())
    }

    sqlx::query(
        r"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );
            ",
    )
    .execute(pool)
    .await?;

    if !is_applied(pool, 1).await? {
        let mut tx = pool.begin().await?;

        for statement in SCHEMA_V1 {
            sqlx::query(statement).execute(&mut *tx).await?;
        }

        sqlx::query(
            r"
                INSERT INTO schema_migrations (version, applied_at)
                VALUES (?1, ?2)
                ON CONFLICT(version) DO NOTHING
            ",
        )
        .bind(1_i64)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::debug!(version = 1, "applied schema migration");
    }

    Ok(())
}
