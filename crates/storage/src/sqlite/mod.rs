use std::sync::Arc;
use std::time::Duration;

use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use thiserror::Error;
use tracing::info;

use crate::repository::{AttemptRepository, QuestionSource, SessionRepository, Storage};

mod attempt_repo;
mod mapping;
mod migrate;
mod question_repo;
mod session_repo;

#[derive(Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SqliteInitError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// How long a statement waits on a locked database before failing.
///
/// Must stay below the fallback store's call timeout: a statement abandoned by
/// the timeout keeps running on the driver's worker and could still commit.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(1500);

impl SqliteRepository {
    /// Connect to `SQLite` using the given URL and [`DEFAULT_BUSY_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// Returns `SqliteInitError` if the connection cannot be established or if
    /// enforcing foreign key constraints fails during setup.
    pub async fn connect(database_url: &str) -> Result<Self, SqliteInitError> {
        Self::connect_with_busy_timeout(database_url, DEFAULT_BUSY_TIMEOUT).await
    }

    /// Connect with an explicit lock wait.
    ///
    /// # Errors
    ///
    /// Returns `SqliteInitError` if the connection cannot be established or if
    /// a connection PRAGMA fails.
    pub async fn connect_with_busy_timeout(
        database_url: &str,
        busy_timeout: Duration,
    ) -> Result<Self, SqliteInitError> {
        let busy_ms = u64::try_from(busy_timeout.as_millis()).unwrap_or(u64::MAX);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    sqlx::query("PRAGMA foreign_keys = ON;")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA journal_mode = WAL;")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query(&format!("PRAGMA busy_timeout = {busy_ms};"))
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;
        info!(url = database_url, busy_ms, "connected to sqlite");
        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns `SqliteInitError` if migration queries fail.
    pub async fn migrate(&self) -> Result<(), SqliteInitError> {
        migrate::run_migrations(&self.pool).await
    }
}

impl Storage {
    /// Build a `Storage` backed by `SQLite`; the same database also serves
    /// as the question source.
    ///
    /// # Errors
    ///
    /// Returns `SqliteInitError` if connection or migrations cannot be
    /// completed.
    pub async fn sqlite(database_url: &str) -> Result<Self, SqliteInitError> {
        Self::sqlite_with_busy_timeout(database_url, DEFAULT_BUSY_TIMEOUT).await
    }

    /// Like [`Storage::sqlite`] with an explicit lock wait; keep it below the
    /// fallback store timeout.
    ///
    /// # Errors
    ///
    /// Returns `SqliteInitError` if connection or migrations cannot be
    /// completed.
    pub async fn sqlite_with_busy_timeout(
        database_url: &str,
        busy_timeout: Duration,
    ) -> Result<Self, SqliteInitError> {
        let repo = SqliteRepository::connect_with_busy_timeout(database_url, busy_timeout).await?;
        repo.migrate().await?;
        Ok(Self::from_sqlite(repo))
    }

    #[must_use]
    pub fn from_sqlite(repo: SqliteRepository) -> Self {
        let sessions: Arc<dyn SessionRepository> = Arc::new(repo.clone());
        let attempts: Arc<dyn AttemptRepository> = Arc::new(repo.clone());
        let questions: Arc<dyn QuestionSource> = Arc::new(repo);
        Self {
            sessions,
            attempts,
            questions,
        }
    }
}
