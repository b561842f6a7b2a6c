use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

use crate::model::{QuestionId, Session};

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum NavigationError {
    #[error("cannot move {direction} from index {index} of {len}")]
    OutOfRange {
        direction: Direction,
        index: usize,
        len: usize,
    },

    #[error("invalid question index {index}; session has {len} questions")]
    InvalidIndex { index: usize, len: usize },

    #[error("invalid navigation direction: {0}")]
    InvalidDirection(String),
}

//
// ─── DIRECTION ─────────────────────────────────────────────────────────────────
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Next,
    Previous,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Next => f.write_str("next"),
            Direction::Previous => f.write_str("previous"),
        }
    }
}

impl FromStr for Direction {
    type Err = NavigationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "next" => Ok(Direction::Next),
            "previous" | "prev" => Ok(Direction::Previous),
            _ => Err(NavigationError::InvalidDirection(s.to_owned())),
        }
    }
}

//
// ─── CURSOR ────────────────────────────────────────────────────────────────────
//

/// What the cursor currently points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor<'a> {
    At { index: usize, question_id: &'a QuestionId },
    NoneLeft,
}

/// Boundary flags for the current position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Boundaries {
    pub has_previous: bool,
    pub has_next: bool,
    pub is_last: bool,
}

#[must_use]
pub fn current_question_id(session: &Session) -> Cursor<'_> {
    let index = session.current_index();
    match session.question_ids().get(index) {
        Some(question_id) => Cursor::At { index, question_id },
        None => Cursor::NoneLeft,
    }
}

#[must_use]
pub fn boundaries(session: &Session) -> Boundaries {
    let index = session.current_index();
    let len = session.total_questions();
    Boundaries {
        has_previous: index > 0,
        has_next: index + 1 < len,
        is_last: len > 0 && index == len - 1,
    }
}

/// Step the cursor one position. The sequence itself is never reordered.
///
/// # Errors
///
/// Returns `NavigationError::OutOfRange` at either end; the cursor is left unchanged.
pub fn advance(
    session: &mut Session,
    direction: Direction,
    now: DateTime<Utc>,
) -> Result<usize, NavigationError> {
    let index = session.current_index();
    let len = session.total_questions();
    let target = match direction {
        Direction::Next if index + 1 < len => index + 1,
        // A cursor parked past the end (index == len) may step back onto the last question.
        Direction::Previous if index > 0 => index - 1,
        _ => {
            return Err(NavigationError::OutOfRange {
                direction,
                index,
                len,
            });
        }
    };
    session.set_current_index(target, now);
    Ok(target)
}

/// Move the cursor to an absolute position.
///
/// # Errors
///
/// Returns `NavigationError::InvalidIndex` unless `0 <= index < len`.
pub fn jump(session: &mut Session, index: usize, now: DateTime<Utc>) -> Result<usize, NavigationError> {
    let len = session.total_questions();
    if index >= len {
        return Err(NavigationError::InvalidIndex { index, len });
    }
    session.set_current_index(index, now);
    Ok(index)
}
