#![forbid(unsafe_code)]

pub mod fallback;
pub mod questions;
pub mod repository;
pub mod sqlite;

pub use fallback::{Backend, FallbackStore, Stored};
pub use questions::InMemoryQuestionBank;
pub use repository::{
    AttemptRepository, InMemoryRepository, QuestionSource, QuestionSourceError,
    SessionRepository, Storage, StorageError,
};
