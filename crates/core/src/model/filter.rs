use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::question::Question;

#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum FilterError {
    #[error("year range is inverted: {start} > {end}")]
    InvertedYearRange { start: i32, end: i32 },

    #[error("marks range is inverted: {min} > {max}")]
    InvertedMarksRange { min: f64, max: f64 },

    #[error("marks bound must be a finite, non-negative number")]
    InvalidMarks,

    #[error("{field} must not be blank")]
    BlankField { field: &'static str },
}

/// Inclusive range of exam years.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearRange {
    pub start: i32,
    pub end: i32,
}

impl YearRange {
    #[must_use]
    pub fn contains(&self, year: i32) -> bool {
        (self.start..=self.end).contains(&year)
    }
}

/// Immutable criteria used to build a practice session.
///
/// All criteria are conjunctive; `None` / empty means "no constraint".
/// The filter is snapshotted into the session it produced and never
/// consulted again after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionFilter {
    pub exam_id: Option<String>,
    pub subject_id: Option<String>,
    pub chapter_id: Option<String>,
    pub topic_id: Option<String>,
    pub concept_id: Option<String>,
    pub year: Option<i32>,
    pub year_range: Option<YearRange>,
    pub exam_session: Option<String>,
    pub source: Option<String>,
    pub difficulty_level: Option<String>,
    pub question_type: Option<String>,
    pub marks_min: Option<f64>,
    pub marks_max: Option<f64>,
    pub tags: Vec<String>,
    pub shuffle: bool,
    pub include_solved: bool,
}

impl Default for SessionFilter {
    fn default() -> Self {
        Self {
            exam_id: None,
            subject_id: None,
            chapter_id: None,
            topic_id: None,
            concept_id: None,
            year: None,
            year_range: None,
            exam_session: None,
            source: None,
            difficulty_level: None,
            question_type: None,
            marks_min: None,
            marks_max: None,
            tags: Vec::new(),
            shuffle: false,
            include_solved: true,
        }
    }
}

impl SessionFilter {
    /// Filter with no criteria that keeps previously solved questions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    #[must_use]
    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Check the filter for internally inconsistent criteria.
    ///
    /// # Errors
    ///
    /// Returns `FilterError` for inverted ranges, negative or non-finite marks,
    /// and blank identifier/label strings.
    pub fn validate(&self) -> Result<(), FilterError> {
        let strings: [(&'static str, &Option<String>); 9] = [
            ("exam_id", &self.exam_id),
            ("subject_id", &self.subject_id),
            ("chapter_id", &self.chapter_id),
            ("topic_id", &self.topic_id),
            ("concept_id", &self.concept_id),
            ("exam_session", &self.exam_session),
            ("source", &self.source),
            ("difficulty_level", &self.difficulty_level),
            ("question_type", &self.question_type),
        ];
        for (field, value) in strings {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                return Err(FilterError::BlankField { field });
            }
        }
        if self.tags.iter().any(|t| t.trim().is_empty()) {
            return Err(FilterError::BlankField { field: "tags" });
        }

        if let Some(range) = self.year_range
            && range.start > range.end
        {
            return Err(FilterError::InvertedYearRange {
                start: range.start,
                end: range.end,
            });
        }

        for bound in [self.marks_min, self.marks_max].into_iter().flatten() {
            if !bound.is_finite() || bound < 0.0 {
                return Err(FilterError::InvalidMarks);
            }
        }
        if let (Some(min), Some(max)) = (self.marks_min, self.marks_max)
            && min > max
        {
            return Err(FilterError::InvertedMarksRange { min, max });
        }

        Ok(())
    }

    /// True when any criterion needs PYQ metadata to be evaluated.
    #[must_use]
    pub fn has_metadata_criteria(&self) -> bool {
        self.year.is_some()
            || self.year_range.is_some()
            || self.exam_session.is_some()
            || self.source.is_some()
            || self.difficulty_level.is_some()
            || self.question_type.is_some()
            || self.marks_min.is_some()
            || self.marks_max.is_some()
            || !self.tags.is_empty()
    }

    /// Evaluate the hierarchy scope against a question.
    #[must_use]
    pub fn matches_scope(&self, question: &Question) -> bool {
        let scope = &question.scope;
        eq_opt(&self.exam_id, &scope.exam_id)
            && eq_opt(&self.subject_id, &scope.subject_id)
            && eq_opt(&self.chapter_id, &scope.chapter_id)
            && eq_opt(&self.topic_id, &scope.topic_id)
            && eq_opt(&self.concept_id, &scope.concept_id)
    }

    /// Evaluate the metadata criteria against a question.
    ///
    /// Questions without metadata only match when no metadata criterion is set.
    #[must_use]
    pub fn matches_metadata(&self, question: &Question) -> bool {
        if !self.has_metadata_criteria() {
            return true;
        }
        let Some(meta) = question.metadata.as_ref() else {
            return false;
        };

        if self.year.is_some_and(|y| meta.year != Some(y)) {
            return false;
        }
        if let Some(range) = self.year_range
            && !meta.year.is_some_and(|y| range.contains(y))
        {
            return false;
        }
        if !label_matches(&self.exam_session, &meta.exam_session)
            || !label_matches(&self.source, &meta.source)
            || !label_matches(&self.difficulty_level, &meta.difficulty_level)
            || !label_matches(&self.question_type, &meta.question_type)
        {
            return false;
        }

        if self.marks_min.is_some() || self.marks_max.is_some() {
            let Some(marks) = meta.marks_allocated else {
                return false;
            };
            if self.marks_min.is_some_and(|min| marks < min)
                || self.marks_max.is_some_and(|max| marks > max)
            {
                return false;
            }
        }

        self.tags.iter().all(|wanted| {
            meta.tags
                .iter()
                .any(|have| have.trim().eq_ignore_ascii_case(wanted.trim()))
        })
    }

    #[must_use]
    pub fn matches(&self, question: &Question) -> bool {
        self.matches_scope(question) && self.matches_metadata(question)
    }
}

fn eq_opt(wanted: &Option<String>, have: &Option<String>) -> bool {
    match wanted {
        None => true,
        Some(w) => have.as_deref() == Some(w.as_str()),
    }
}

fn label_matches(wanted: &Option<String>, have: &Option<String>) -> bool {
    match wanted {
        None => true,
        Some(w) => have
            .as_deref()
            .is_some_and(|h| h.trim().eq_ignore_ascii_case(w.trim())),
    }
}
