mod service;
mod view;

pub use service::{NewSession, PracticeService};
pub use view::{CurrentQuestion, Grade, NavState, PositionedQuestion, QuestionView, SessionSummary};
