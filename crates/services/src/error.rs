//! Shared error types for the services crate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use pyq_core::model::{FilterError, QuestionId, SessionId, SessionStateError};
use pyq_core::sequencer::NavigationError;
use storage::repository::{QuestionSourceError, StorageError};

/// Error categories reported across the public operation surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    NoQuestionsMatched,
    OutOfRange,
    InvalidIndex,
    ValidationError,
    InvalidState,
    BackendDegraded,
    Internal,
}

/// Errors emitted by `PracticeService`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PracticeError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("question not found: {0}")]
    QuestionNotFound(QuestionId),
    #[error("question {question_id} is not part of session {session_id}")]
    QuestionNotInSession {
        session_id: SessionId,
        question_id: QuestionId,
    },
    #[error("no questions matched the filter")]
    NoQuestionsMatched,
    #[error("invalid question index {0}")]
    NegativeIndex(i64),
    #[error("{0}")]
    Validation(String),
    #[error("invalid filter: {0}")]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Navigation(#[from] NavigationError),
    #[error(transparent)]
    State(#[from] SessionStateError),
    #[error(transparent)]
    Source(#[from] QuestionSourceError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl PracticeError {
    /// Public category for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            PracticeError::SessionNotFound(_) | PracticeError::QuestionNotFound(_) => {
                ErrorKind::NotFound
            }
            PracticeError::NoQuestionsMatched
            | PracticeError::State(SessionStateError::NoQuestions) => {
                ErrorKind::NoQuestionsMatched
            }
            PracticeError::NegativeIndex(_)
            | PracticeError::Navigation(NavigationError::InvalidIndex { .. }) => {
                ErrorKind::InvalidIndex
            }
            PracticeError::Navigation(NavigationError::OutOfRange { .. }) => ErrorKind::OutOfRange,
            PracticeError::QuestionNotInSession { .. }
            | PracticeError::Validation(_)
            | PracticeError::Filter(_)
            | PracticeError::Navigation(_) => ErrorKind::ValidationError,
            PracticeError::State(_) => ErrorKind::InvalidState,
            PracticeError::Source(QuestionSourceError::Unavailable(_)) => {
                ErrorKind::BackendDegraded
            }
            PracticeError::Storage(StorageError::NotFound) => ErrorKind::NotFound,
            PracticeError::Storage(e) if e.is_unavailable() => ErrorKind::BackendDegraded,
            PracticeError::Source(_) | PracticeError::Storage(_) => ErrorKind::Internal,
        }
    }
}
