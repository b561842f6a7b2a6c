#![forbid(unsafe_code)]

pub mod api;
pub mod config;
pub mod error;
pub mod locks;
pub mod practice;

pub use pyq_core::Clock;

pub use api::{PracticeApi, Reply, ReplyError};
pub use config::PracticeConfig;
pub use error::{ErrorKind, PracticeError};
pub use practice::{
    CurrentQuestion, Grade, NavState, NewSession, PositionedQuestion, PracticeService,
    QuestionView, SessionSummary,
};
