use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{SeedableRng, rng};
use tracing::{debug, info, warn};

use pyq_core::Clock;
use pyq_core::grading::is_correct;
use pyq_core::model::{
    Attempt, Question, QuestionId, Session, SessionFilter, SessionId, SessionPatch,
    SessionStateError, SessionStatus, StatusFilter, UserId,
};
use pyq_core::progress::ProgressReport;
use pyq_core::sequencer::{self, Cursor, Direction};
use storage::repository::{QuestionSource, QuestionSourceError};
use storage::{Backend, FallbackStore, Stored};

use super::view::{CurrentQuestion, Grade, NavState, PositionedQuestion, SessionSummary};
use crate::config::PracticeConfig;
use crate::error::PracticeError;
use crate::locks::SessionLocks;

/// Parameters for `PracticeService::create_session`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSession {
    pub user_id: UserId,
    /// Blank or absent names fall back to the configured default.
    pub name: Option<String>,
    pub filter: SessionFilter,
    pub time_limit_minutes: Option<u32>,
}

impl NewSession {
    #[must_use]
    pub fn new(user_id: impl Into<UserId>, filter: SessionFilter) -> Self {
        Self {
            user_id: user_id.into(),
            name: None,
            filter,
            time_limit_minutes: None,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_time_limit(mut self, minutes: u32) -> Self {
        self.time_limit_minutes = Some(minutes);
        self
    }
}

/// The practice session engine.
///
/// Creates sessions from a filtered question pool, moves the cursor, grades
/// and records answers, and aggregates progress. Every result carries the
/// backend that served it so callers can flag degraded mode. Mutations of one
/// session are serialized; different sessions proceed independently.
#[derive(Clone)]
pub struct PracticeService {
    clock: Clock,
    config: PracticeConfig,
    store: FallbackStore,
    questions: Arc<dyn QuestionSource>,
    secondary: Option<Arc<dyn QuestionSource>>,
    locks: SessionLocks,
}

impl PracticeService {
    #[must_use]
    pub fn new(clock: Clock, store: FallbackStore, questions: Arc<dyn QuestionSource>) -> Self {
        let config = PracticeConfig::default();
        Self {
            clock,
            store: store.with_timeout(config.store_timeout),
            config,
            questions,
            secondary: None,
            locks: SessionLocks::new(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: PracticeConfig) -> Self {
        self.store = self.store.with_timeout(config.store_timeout);
        self.config = config;
        self
    }

    /// Question source consulted when the primary fails or finds nothing.
    #[must_use]
    pub fn with_secondary_source(mut self, source: Arc<dyn QuestionSource>) -> Self {
        self.secondary = Some(source);
        self
    }

    #[must_use]
    pub fn config(&self) -> &PracticeConfig {
        &self.config
    }

    /// The underlying store, for operator tasks such as reconciliation.
    #[must_use]
    pub fn store(&self) -> &FallbackStore {
        &self.store
    }

    //
    // ─── CREATION ──────────────────────────────────────────────────────────────
    //

    /// Resolve the filter, freeze the question order and persist a new session.
    ///
    /// # Errors
    ///
    /// Returns `PracticeError::Validation`/`Filter` for bad input,
    /// `PracticeError::NoQuestionsMatched` if nothing is left after filtering,
    /// and `PracticeError::Source` if no question source could answer.
    pub async fn create_session(&self, request: NewSession) -> Result<Stored<Session>, PracticeError> {
        let NewSession {
            user_id,
            name,
            filter,
            time_limit_minutes,
        } = request;

        if user_id.as_str().trim().is_empty() {
            return Err(PracticeError::Validation("user_id must not be blank".into()));
        }
        if time_limit_minutes == Some(0) {
            return Err(PracticeError::Validation(
                "time_limit_minutes must be positive".into(),
            ));
        }
        filter.validate()?;
        let name = name
            .map(|n| n.trim().to_owned())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| self.config.default_session_name.clone());

        let mut questions = self.resolve_questions(&filter).await?;
        let mut seen = HashSet::with_capacity(questions.len());
        questions.retain(|q| seen.insert(q.id.clone()));

        let mut backend = Backend::Durable;
        if !filter.include_solved {
            let solved = self.store.solved_question_ids(&user_id).await?;
            backend = backend.combine(solved.backend);
            questions.retain(|q| !solved.value.contains(&q.id));
        }
        if questions.is_empty() {
            return Err(PracticeError::NoQuestionsMatched);
        }

        if filter.shuffle {
            match self.config.shuffle_seed {
                Some(seed) => questions.shuffle(&mut StdRng::seed_from_u64(seed)),
                None => questions.shuffle(&mut rng()),
            }
        }

        let now = self.clock.now();
        let question_ids: Vec<QuestionId> = questions.iter().map(|q| q.id.clone()).collect();
        let session = Session::new(
            SessionId::generate(),
            user_id,
            name,
            filter,
            question_ids,
            time_limit_minutes,
            now,
        )?;

        let created = self.store.create(session).await?;
        self.store
            .snapshot_questions(created.value.id(), &questions)?;
        info!(
            session_id = %created.value.id(),
            user_id = %created.value.user_id(),
            questions = created.value.total_questions(),
            fallback = created.is_fallback(),
            "practice session created"
        );

        Ok(Stored {
            backend: backend.combine(created.backend),
            value: created.value,
        })
    }

    //
    // ─── NAVIGATION ────────────────────────────────────────────────────────────
    //

    /// The question under the cursor with navigation state.
    ///
    /// Refreshes the session's activity timestamp.
    ///
    /// # Errors
    ///
    /// Returns `PracticeError::SessionNotFound` or `PracticeError::QuestionNotFound`.
    pub async fn get_current(&self, id: SessionId) -> Result<Stored<CurrentQuestion>, PracticeError> {
        let _guard = self.locks.acquire(id).await;
        let loaded = self.load_session(id).await?;
        let mut backend = loaded.backend;
        let session = loaded.value;
        let now = self.clock.now();

        let question_id = match sequencer::current_question_id(&session) {
            Cursor::At { question_id, .. } => question_id.clone(),
            Cursor::NoneLeft => {
                let touched = self.store.update(id, &SessionPatch::touch(now)).await?;
                return Ok(Stored {
                    value: CurrentQuestion::NoneLeft {
                        nav: NavState::of(&touched.value),
                        session_completed: true,
                    },
                    backend: backend.combine(touched.backend),
                });
            }
        };

        let question = self.load_question(id, &question_id).await?;
        let previous = self.store.attempt_for(id, &question_id).await?;
        let touched = self.store.update(id, &SessionPatch::touch(now)).await?;
        backend = backend.combine(previous.backend).combine(touched.backend);

        let session = touched.value;
        Ok(Stored {
            value: CurrentQuestion::At(Box::new(PositionedQuestion {
                question: question.into(),
                nav: NavState::of(&session),
                previous_attempt: previous.value,
                deadline: session.deadline(),
            })),
            backend,
        })
    }

    /// Move the cursor one step.
    ///
    /// # Errors
    ///
    /// Returns `PracticeError::Navigation` at either end (cursor unchanged) and
    /// `PracticeError::State` for expired sessions.
    pub async fn navigate(
        &self,
        id: SessionId,
        direction: Direction,
    ) -> Result<Stored<usize>, PracticeError> {
        let _guard = self.locks.acquire(id).await;
        let loaded = self.load_session(id).await?;
        let mut session = loaded.value;
        session.ensure_open()?;

        let now = self.clock.now();
        let index = sequencer::advance(&mut session, direction, now)?;
        let updated = self.store.update(id, &SessionPatch::cursor(index, now)).await?;
        debug!(session_id = %id, %direction, index, "cursor moved");
        Ok(Stored {
            value: updated.value.current_index(),
            backend: loaded.backend.combine(updated.backend),
        })
    }

    /// Move the cursor to an absolute position.
    ///
    /// # Errors
    ///
    /// Returns `PracticeError::Navigation` for an index outside the sequence and
    /// `PracticeError::State` for expired sessions.
    pub async fn jump(&self, id: SessionId, index: usize) -> Result<Stored<usize>, PracticeError> {
        let _guard = self.locks.acquire(id).await;
        let loaded = self.load_session(id).await?;
        let mut session = loaded.value;
        session.ensure_open()?;

        let now = self.clock.now();
        let index = sequencer::jump(&mut session, index, now)?;
        let updated = self.store.update(id, &SessionPatch::cursor(index, now)).await?;
        debug!(session_id = %id, index, "cursor jumped");
        Ok(Stored {
            value: updated.value.current_index(),
            backend: loaded.backend.combine(updated.backend),
        })
    }

    //
    // ─── ANSWERS ───────────────────────────────────────────────────────────────
    //

    /// Grade and record an answer, then recount the session from its attempts.
    ///
    /// Re-submitting a question overwrites the earlier attempt and keeps its
    /// response id. The session completes once every question has an attempt.
    ///
    /// # Errors
    ///
    /// Returns `PracticeError::QuestionNotInSession` for a foreign question and
    /// `PracticeError::State` for expired sessions.
    pub async fn submit_answer(
        &self,
        id: SessionId,
        question_id: &QuestionId,
        answer: &str,
        time_taken_seconds: u32,
    ) -> Result<Stored<Grade>, PracticeError> {
        let _guard = self.locks.acquire(id).await;
        let loaded = self.load_session(id).await?;
        let session = loaded.value;
        session.ensure_open()?;
        if !session.contains_question(question_id) {
            return Err(PracticeError::QuestionNotInSession {
                session_id: id,
                question_id: question_id.clone(),
            });
        }

        let question = self.load_question(id, question_id).await?;
        let correct = is_correct(&question.correct_answer, answer);
        let now = self.clock.now();

        let recorded = self
            .store
            .record_attempt(&Attempt::new(
                id,
                question_id.clone(),
                answer,
                correct,
                time_taken_seconds,
                now,
            ))
            .await?;
        let attempts = self.store.attempts(id).await?;

        let mut recounted = session.clone();
        let counters = recounted.recount(&attempts.value, now);
        let mut patch = SessionPatch::touch(now).with_counters(counters);
        if recounted.status() != session.status() {
            patch = patch.with_status(recounted.status());
        }
        let updated = self.store.update(id, &patch).await?;
        if updated.value.status() == SessionStatus::Completed
            && session.status() != SessionStatus::Completed
        {
            info!(session_id = %id, correct = counters.correct, "practice session completed");
        }

        Ok(Stored {
            value: Grade {
                is_correct: correct,
                correct_answer: question.correct_answer.clone(),
                explanation: question.solution().unwrap_or_default().to_owned(),
                response_id: recorded.value.id,
                session_status: updated.value.status(),
            },
            backend: loaded
                .backend
                .combine(recorded.backend)
                .combine(attempts.backend)
                .combine(updated.backend),
        })
    }

    //
    // ─── PROGRESS & LIFECYCLE ──────────────────────────────────────────────────
    //

    /// Statistics derived from the session's attempts at call time.
    ///
    /// # Errors
    ///
    /// Returns `PracticeError::SessionNotFound` if neither store has the session.
    pub async fn get_progress(&self, id: SessionId) -> Result<Stored<ProgressReport>, PracticeError> {
        let loaded = self.load_session(id).await?;
        let attempts = self.store.attempts(id).await?;
        let report = ProgressReport::compute(&loaded.value, &attempts.value, self.clock.now());
        Ok(Stored {
            value: report,
            backend: loaded.backend.combine(attempts.backend),
        })
    }

    /// `Active → Paused`.
    ///
    /// # Errors
    ///
    /// Returns `PracticeError::State` unless the session is active.
    pub async fn pause(&self, id: SessionId) -> Result<Stored<Session>, PracticeError> {
        self.transition(id, Session::pause).await
    }

    /// `Paused → Active`.
    ///
    /// # Errors
    ///
    /// Returns `PracticeError::State` unless the session is paused.
    pub async fn resume(&self, id: SessionId) -> Result<Stored<Session>, PracticeError> {
        self.transition(id, Session::resume).await
    }

    /// Mark a session expired; called by whatever enforces time limits.
    ///
    /// # Errors
    ///
    /// Returns `PracticeError::State` for sessions already completed or expired.
    pub async fn expire(&self, id: SessionId) -> Result<Stored<Session>, PracticeError> {
        self.transition(id, Session::expire).await
    }

    /// A user's sessions, newest first.
    ///
    /// # Errors
    ///
    /// Returns `PracticeError::Validation` for a blank user id.
    pub async fn list_sessions(
        &self,
        user_id: &UserId,
        status: StatusFilter,
    ) -> Result<Stored<Vec<SessionSummary>>, PracticeError> {
        if user_id.as_str().trim().is_empty() {
            return Err(PracticeError::Validation("user_id must not be blank".into()));
        }
        let listed = self.store.list_by_user(user_id, status).await?;
        let summaries = listed
            .value
            .iter()
            .map(|row| SessionSummary::from_session(&row.value, row.is_fallback()))
            .collect();
        Ok(Stored {
            value: summaries,
            backend: listed.backend,
        })
    }

    //
    // ─── INTERNALS ─────────────────────────────────────────────────────────────
    //

    async fn transition<F>(&self, id: SessionId, apply: F) -> Result<Stored<Session>, PracticeError>
    where
        F: FnOnce(&mut Session, DateTime<Utc>) -> Result<(), SessionStateError>,
    {
        let _guard = self.locks.acquire(id).await;
        let loaded = self.load_session(id).await?;
        let mut session = loaded.value;
        let before = session.status();
        let now = self.clock.now();
        apply(&mut session, now)?;

        let updated = self
            .store
            .update(id, &SessionPatch::status(session.status(), now))
            .await?;
        info!(session_id = %id, from = %before, to = %updated.value.status(), "session status changed");
        Ok(Stored {
            value: updated.value,
            backend: loaded.backend.combine(updated.backend),
        })
    }

    async fn load_session(&self, id: SessionId) -> Result<Stored<Session>, PracticeError> {
        self.store
            .get(id)
            .await?
            .ok_or(PracticeError::SessionNotFound(id))
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, QuestionSourceError>>,
    ) -> Result<T, QuestionSourceError> {
        tokio::time::timeout(self.config.store_timeout, fut)
            .await
            .unwrap_or_else(|_| {
                Err(QuestionSourceError::Unavailable(format!(
                    "timed out after {:?}",
                    self.config.store_timeout
                )))
            })
    }

    /// Primary source, then the secondary when the primary fails or is empty.
    async fn resolve_questions(&self, filter: &SessionFilter) -> Result<Vec<Question>, PracticeError> {
        let primary = self.bounded(self.questions.resolve(filter)).await;
        let primary_err = match primary {
            Ok(found) if !found.is_empty() => return Ok(found),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "primary question source failed");
                Some(e)
            }
        };

        let Some(secondary) = &self.secondary else {
            return match primary_err {
                Some(e) => Err(e.into()),
                None => Ok(Vec::new()),
            };
        };
        match self.bounded(secondary.resolve(filter)).await {
            Ok(found) => {
                debug!(questions = found.len(), "resolved from secondary question source");
                Ok(found)
            }
            Err(e) => {
                warn!(error = %e, "secondary question source failed");
                match primary_err {
                    Some(first) => Err(first.into()),
                    None => Ok(Vec::new()),
                }
            }
        }
    }

    /// Look a question up in the sources, then in the session's snapshot.
    async fn load_question(
        &self,
        session_id: SessionId,
        question_id: &QuestionId,
    ) -> Result<Question, PracticeError> {
        let sources = std::iter::once(&self.questions).chain(self.secondary.as_ref());
        for source in sources {
            match self.bounded(source.get_question(question_id)).await {
                Ok(Some(question)) => return Ok(question),
                Ok(None) => {}
                Err(e) => {
                    warn!(session_id = %session_id, question_id = %question_id, error = %e, "question lookup failed");
                }
            }
        }

        self.store
            .snapshot_question(session_id, question_id)?
            .ok_or_else(|| PracticeError::QuestionNotFound(question_id.clone()))
    }
}
