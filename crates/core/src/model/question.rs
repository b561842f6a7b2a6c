use serde::{Deserialize, Serialize};

use crate::model::QuestionId;

/// Position of a question in the exam → subject → chapter → topic → concept catalog.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuestionScope {
    pub exam_id: Option<String>,
    pub subject_id: Option<String>,
    pub chapter_id: Option<String>,
    pub topic_id: Option<String>,
    pub concept_id: Option<String>,
}

/// Paper-level details attached to a previously asked question.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PyqMetadata {
    pub year: Option<i32>,
    pub exam_session: Option<String>,
    pub paper_code: Option<String>,
    pub question_number: Option<String>,
    pub marks_allocated: Option<f64>,
    pub time_allocated_minutes: Option<u32>,
    pub solution: Option<String>,
    pub source: Option<String>,
    pub tags: Vec<String>,
    pub difficulty_level: Option<String>,
    pub question_type: Option<String>,
}

/// A question record as delivered by a question source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: QuestionId,
    pub content: String,
    #[serde(default)]
    pub options: Vec<String>,
    pub correct_answer: String,
    #[serde(default)]
    pub scope: QuestionScope,
    #[serde(default)]
    pub metadata: Option<PyqMetadata>,
}

impl Question {
    #[must_use]
    pub fn new(
        id: impl Into<QuestionId>,
        content: impl Into<String>,
        correct_answer: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            options: Vec::new(),
            correct_answer: correct_answer.into(),
            scope: QuestionScope::default(),
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_scope(mut self, scope: QuestionScope) -> Self {
        self.scope = scope;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: PyqMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Worked solution shown after a submission, if the paper has one.
    #[must_use]
    pub fn solution(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.solution.as_deref())
    }
}

impl From<String> for QuestionId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}
