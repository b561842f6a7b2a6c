use async_trait::async_trait;
use pyq_core::model::{Question, QuestionId, SessionFilter};
use std::sync::{Arc, RwLock};

use crate::repository::{QuestionSource, QuestionSourceError};

/// Question catalog held in memory, in insertion order.
#[derive(Clone, Default)]
pub struct InMemoryQuestionBank {
    questions: Arc<RwLock<Vec<Question>>>,
}

impl InMemoryQuestionBank {
    #[must_use]
    pub fn new(questions: Vec<Question>) -> Self {
        Self {
            questions: Arc::new(RwLock::new(questions)),
        }
    }

    /// Insert a question, replacing any record with the same id in place.
    ///
    /// # Errors
    ///
    /// Returns `QuestionSourceError::Unavailable` if the lock is poisoned.
    pub fn upsert(&self, question: Question) -> Result<(), QuestionSourceError> {
        let mut guard = self
            .questions
            .write()
            .map_err(|e| QuestionSourceError::Unavailable(e.to_string()))?;
        match guard.iter_mut().find(|q| q.id == question.id) {
            Some(slot) => *slot = question,
            None => guard.push(question),
        }
        Ok(())
    }
}

#[async_trait]
impl QuestionSource for InMemoryQuestionBank {
    async fn resolve(&self, filter: &SessionFilter) -> Result<Vec<Question>, QuestionSourceError> {
        let guard = self
            .questions
            .read()
            .map_err(|e| QuestionSourceError::Unavailable(e.to_string()))?;
        Ok(guard.iter().filter(|q| filter.matches(q)).cloned().collect())
    }

    async fn get_question(&self, id: &QuestionId) -> Result<Option<Question>, QuestionSourceError> {
        let guard = self
            .questions
            .read()
            .map_err(|e| QuestionSourceError::Unavailable(e.to_string()))?;
        Ok(guard.iter().find(|q| &q.id == id).cloned())
    }
}
