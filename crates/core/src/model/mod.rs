mod attempt;
mod filter;
mod ids;
mod question;
mod session;

pub use attempt::{Attempt, QuestionStatus};
pub use filter::{FilterError, SessionFilter, YearRange};
pub use ids::{ParseIdError, QuestionId, ResponseId, SessionId, UserId};
pub use question::{PyqMetadata, Question, QuestionScope};
pub use session::{
    PersistedStateError, Session, SessionCounters, SessionPatch, SessionStateError,
    SessionStatus, StatusFilter,
};
