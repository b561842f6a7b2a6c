//! Structured request/response surface over `PracticeService`.
//!
//! Inputs arrive as loosely typed values (strings, signed integers) and every
//! call returns a [`Reply`]; errors are reported in-band, never raised.

use serde::Serialize;
use tracing::{debug, warn};

use pyq_core::model::{QuestionId, Session, SessionFilter, SessionId, StatusFilter, UserId};
use pyq_core::progress::ProgressReport;
use pyq_core::sequencer::Direction;
use storage::Stored;

use crate::error::{ErrorKind, PracticeError};
use crate::practice::{CurrentQuestion, Grade, NewSession, PracticeService, SessionSummary};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplyError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of one public operation.
///
/// `fallback` is set whenever any part of the call was served by the
/// in-memory fallback, so state may not survive a restart.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ReplyError>,
    pub fallback: bool,
}

impl<T> Reply<T> {
    #[must_use]
    pub fn ok(data: T, fallback: bool) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            fallback,
        }
    }

    #[must_use]
    pub fn failure(err: &PracticeError) -> Self {
        let kind = err.kind();
        match kind {
            ErrorKind::Internal | ErrorKind::BackendDegraded => {
                warn!(?kind, error = %err, "practice request failed");
            }
            _ => debug!(?kind, error = %err, "practice request rejected"),
        }
        Self {
            success: false,
            data: None,
            error: Some(ReplyError {
                kind,
                message: err.to_string(),
            }),
            fallback: false,
        }
    }

    #[must_use]
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    fn from_result(result: Result<Stored<T>, PracticeError>) -> Self {
        match result {
            Ok(stored) => {
                let fallback = stored.is_fallback();
                Self::ok(stored.value, fallback)
            }
            Err(err) => Self::failure(&err),
        }
    }
}

fn parse_session_id(raw: &str) -> Result<SessionId, PracticeError> {
    raw.parse()
        .map_err(|_| PracticeError::Validation(format!("invalid session id: {raw}")))
}

fn non_negative(field: &str, value: i64) -> Result<u32, PracticeError> {
    u32::try_from(value)
        .map_err(|_| PracticeError::Validation(format!("{field} out of range: {value}")))
}

/// Public operations of the practice engine.
#[derive(Clone)]
pub struct PracticeApi {
    service: PracticeService,
}

impl PracticeApi {
    #[must_use]
    pub fn new(service: PracticeService) -> Self {
        Self { service }
    }

    #[must_use]
    pub fn service(&self) -> &PracticeService {
        &self.service
    }

    pub async fn create_session(
        &self,
        user_id: &str,
        name: Option<&str>,
        filter: SessionFilter,
        time_limit_minutes: Option<i64>,
    ) -> Reply<Session> {
        let result = async {
            let mut request = NewSession::new(UserId::new(user_id), filter);
            request.name = name.map(str::to_owned);
            request.time_limit_minutes = time_limit_minutes
                .map(|m| non_negative("time_limit_minutes", m))
                .transpose()?;
            self.service.create_session(request).await
        }
        .await;
        Reply::from_result(result)
    }

    pub async fn get_current(&self, session_id: &str) -> Reply<CurrentQuestion> {
        let result = async {
            let id = parse_session_id(session_id)?;
            self.service.get_current(id).await
        }
        .await;
        Reply::from_result(result)
    }

    pub async fn submit_answer(
        &self,
        session_id: &str,
        question_id: &str,
        answer: &str,
        time_taken_seconds: i64,
    ) -> Reply<Grade> {
        let result = async {
            let id = parse_session_id(session_id)?;
            if question_id.trim().is_empty() {
                return Err(PracticeError::Validation("question_id must not be blank".into()));
            }
            let seconds = non_negative("time_taken_seconds", time_taken_seconds)?;
            self.service
                .submit_answer(id, &QuestionId::new(question_id), answer, seconds)
                .await
        }
        .await;
        Reply::from_result(result)
    }

    pub async fn navigate(&self, session_id: &str, direction: &str) -> Reply<usize> {
        let result = async {
            let id = parse_session_id(session_id)?;
            let direction: Direction = direction.parse()?;
            self.service.navigate(id, direction).await
        }
        .await;
        Reply::from_result(result)
    }

    pub async fn jump(&self, session_id: &str, index: i64) -> Reply<usize> {
        let result = async {
            let id = parse_session_id(session_id)?;
            let index = usize::try_from(index).map_err(|_| PracticeError::NegativeIndex(index))?;
            self.service.jump(id, index).await
        }
        .await;
        Reply::from_result(result)
    }

    pub async fn get_progress(&self, session_id: &str) -> Reply<ProgressReport> {
        let result = async {
            let id = parse_session_id(session_id)?;
            self.service.get_progress(id).await
        }
        .await;
        Reply::from_result(result)
    }

    pub async fn pause(&self, session_id: &str) -> Reply<Session> {
        let result = async {
            let id = parse_session_id(session_id)?;
            self.service.pause(id).await
        }
        .await;
        Reply::from_result(result)
    }

    pub async fn resume(&self, session_id: &str) -> Reply<Session> {
        let result = async {
            let id = parse_session_id(session_id)?;
            self.service.resume(id).await
        }
        .await;
        Reply::from_result(result)
    }

    pub async fn list_sessions(&self, user_id: &str, status: &str) -> Reply<Vec<SessionSummary>> {
        let result = async {
            let status: StatusFilter = status
                .parse()
                .map_err(|e| PracticeError::Validation(format!("{e}")))?;
            self.service
                .list_sessions(&UserId::new(user_id), status)
                .await
        }
        .await;
        Reply::from_result(result)
    }
}
