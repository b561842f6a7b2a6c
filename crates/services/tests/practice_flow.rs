use std::collections::HashSet;
use std::sync::Arc;

use chrono::Duration;
use pyq_core::model::{
    PyqMetadata, Question, QuestionId, QuestionScope, QuestionStatus, Session, SessionCounters,
    SessionFilter, SessionId, SessionStatus, StatusFilter, UserId,
};
use pyq_core::sequencer::Direction;
use pyq_core::time::{fixed_clock, fixed_now};
use services::{
    Clock, CurrentQuestion, ErrorKind, NewSession, PracticeConfig, PracticeError, PracticeService,
};
use storage::repository::{AttemptRepository, SessionRepository};
use storage::{FallbackStore, InMemoryQuestionBank, InMemoryRepository};

fn question(id: &str, subject: &str, answer: &str) -> Question {
    Question::new(id, format!("Question {id}"), answer).with_scope(QuestionScope {
        subject_id: Some(subject.into()),
        ..QuestionScope::default()
    })
}

fn bank() -> InMemoryQuestionBank {
    InMemoryQuestionBank::new(vec![
        question("q1", "S1", "A"),
        question("x1", "S2", "Z"),
        question("q2", "S1", "B"),
        question("q3", "S1", "C").with_metadata(PyqMetadata {
            solution: Some("C is the only option that fits.".into()),
            ..PyqMetadata::default()
        }),
    ])
}

fn store(durable: &InMemoryRepository) -> FallbackStore {
    FallbackStore::new(Arc::new(durable.clone()), Arc::new(durable.clone()))
}

fn service_at(clock: Clock, store: FallbackStore) -> PracticeService {
    PracticeService::new(clock, store, Arc::new(bank()))
}

fn service(durable: &InMemoryRepository) -> PracticeService {
    service_at(fixed_clock(), store(durable))
}

fn s1() -> SessionFilter {
    SessionFilter::new().with_subject("S1")
}

async fn create(svc: &PracticeService, filter: SessionFilter) -> Session {
    svc.create_session(NewSession::new("u1", filter))
        .await
        .unwrap()
        .value
}

#[tokio::test]
async fn subject_walkthrough() {
    let durable = InMemoryRepository::new();
    let svc = service(&durable);

    let created = svc
        .create_session(NewSession::new("u1", s1()))
        .await
        .unwrap();
    assert!(!created.is_fallback());
    let session = created.value;
    let ids: Vec<&str> = session.question_ids().iter().map(QuestionId::as_str).collect();
    assert_eq!(ids, vec!["q1", "q2", "q3"]);
    assert_eq!(session.name(), "PYQ Practice Session");

    let current = svc.get_current(session.id()).await.unwrap();
    let CurrentQuestion::At(at) = current.value else {
        panic!("expected a question");
    };
    assert_eq!(at.question.id.as_str(), "q1");
    assert_eq!(at.nav.current_index, 0);
    assert!(!at.nav.has_previous);
    assert!(at.previous_attempt.is_none());

    let grade = svc
        .submit_answer(session.id(), &QuestionId::new("q1"), "A", 10)
        .await
        .unwrap()
        .value;
    assert!(grade.is_correct);
    assert_eq!(grade.correct_answer, "A");
    assert_eq!(grade.explanation, "");

    let index = svc.navigate(session.id(), Direction::Next).await.unwrap();
    assert_eq!(index.value, 1);

    let progress = svc.get_progress(session.id()).await.unwrap().value;
    assert_eq!(progress.questions_answered, 1);
    assert_eq!(progress.questions_correct, 1);
    assert!((progress.progress_percentage - 100.0 / 3.0).abs() < 1e-9);
    assert_eq!(progress.current_question, 2);
    assert_eq!(
        progress.question_status,
        vec![
            QuestionStatus::Correct,
            QuestionStatus::NotAttempted,
            QuestionStatus::NotAttempted
        ]
    );

    let stored = durable.get_session(session.id()).await.unwrap().unwrap();
    assert_eq!(stored.current_index(), 1);
    assert_eq!(stored.counters().answered, 1);
}

#[tokio::test]
async fn boundaries_leave_the_cursor_alone() {
    let durable = InMemoryRepository::new();
    let svc = service(&durable);
    let session = create(&svc, s1()).await;
    let id = session.id();

    let err = svc.navigate(id, Direction::Previous).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfRange);
    assert_eq!(durable.get_session(id).await.unwrap().unwrap().current_index(), 0);

    assert_eq!(svc.jump(id, 2).await.unwrap().value, 2);
    let err = svc.navigate(id, Direction::Next).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfRange);
    assert_eq!(durable.get_session(id).await.unwrap().unwrap().current_index(), 2);

    let err = svc.jump(id, 3).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidIndex);

    let CurrentQuestion::At(at) = svc.get_current(id).await.unwrap().value else {
        panic!("expected a question");
    };
    assert!(at.nav.is_last);
    assert!(!at.nav.has_next);
    assert!((at.nav.progress_percentage - 200.0 / 3.0).abs() < 1e-9);
}

#[tokio::test]
async fn resubmission_overwrites_without_double_counting() {
    let durable = InMemoryRepository::new();
    let svc = service(&durable);
    let id = create(&svc, s1()).await.id();
    let q2 = QuestionId::new("q2");

    let first = svc.submit_answer(id, &q2, "b", 20).await.unwrap().value;
    let second = svc.submit_answer(id, &q2, "wrong", 5).await.unwrap().value;
    assert!(first.is_correct);
    assert!(!second.is_correct);
    assert_eq!(first.response_id, second.response_id);

    let attempts = durable.attempts_for_session(id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].user_answer, "wrong");

    let stored = durable.get_session(id).await.unwrap().unwrap();
    assert_eq!(
        stored.counters(),
        SessionCounters {
            answered: 1,
            correct: 0,
            incorrect: 1
        }
    );

    let CurrentQuestion::At(at) = svc.get_current(id).await.unwrap().value else {
        panic!("expected a question");
    };
    assert_eq!(at.nav.questions_answered, 1);
}

#[tokio::test]
async fn grading_ignores_case_and_surrounding_space() {
    let durable = InMemoryRepository::new();
    let bank = InMemoryQuestionBank::new(vec![question("geo", "S1", "paris")]);
    let svc = PracticeService::new(fixed_clock(), store(&durable), Arc::new(bank));
    let id = create(&svc, s1()).await.id();

    let grade = svc
        .submit_answer(id, &QuestionId::new("geo"), "  Paris ", 3)
        .await
        .unwrap()
        .value;
    assert!(grade.is_correct);
}

#[tokio::test]
async fn answering_everything_completes_the_session() {
    let durable = InMemoryRepository::new();
    let svc = service(&durable);
    let id = create(&svc, s1()).await.id();

    for (q, answer) in [("q1", "A"), ("q2", "x")] {
        let grade = svc
            .submit_answer(id, &QuestionId::new(q), answer, 4)
            .await
            .unwrap()
            .value;
        assert_eq!(grade.session_status, SessionStatus::Active);
    }
    let last = svc
        .submit_answer(id, &QuestionId::new("q3"), "c", 4)
        .await
        .unwrap()
        .value;
    assert_eq!(last.session_status, SessionStatus::Completed);
    assert_eq!(last.explanation, "C is the only option that fits.");

    let progress = svc.get_progress(id).await.unwrap().value;
    assert!(progress.is_completed);
    assert_eq!(progress.questions_incorrect, 1);
    assert!((progress.accuracy_percentage - 200.0 / 3.0).abs() < 1e-9);

    // Corrections after completion are still graded and recounted.
    let fixed = svc
        .submit_answer(id, &QuestionId::new("q2"), "B", 4)
        .await
        .unwrap()
        .value;
    assert!(fixed.is_correct);
    assert_eq!(fixed.session_status, SessionStatus::Completed);
    assert_eq!(svc.get_progress(id).await.unwrap().value.questions_correct, 3);
}

#[tokio::test]
async fn foreign_question_is_rejected() {
    let durable = InMemoryRepository::new();
    let svc = service(&durable);
    let id = create(&svc, s1()).await.id();

    let err = svc
        .submit_answer(id, &QuestionId::new("x1"), "Z", 1)
        .await
        .unwrap_err();
    assert!(matches!(err, PracticeError::QuestionNotInSession { .. }));
    assert_eq!(err.kind(), ErrorKind::ValidationError);
    assert!(durable.attempts_for_session(id).await.unwrap().is_empty());
}

#[tokio::test]
async fn pause_resume_and_expiry() {
    let durable = InMemoryRepository::new();
    let svc = service(&durable);
    let id = create(&svc, s1()).await.id();

    let paused = svc.pause(id).await.unwrap().value;
    assert_eq!(paused.status(), SessionStatus::Paused);
    assert_eq!(svc.pause(id).await.unwrap_err().kind(), ErrorKind::InvalidState);

    // Paused sessions can still be browsed.
    assert_eq!(svc.navigate(id, Direction::Next).await.unwrap().value, 1);

    let resumed = svc.resume(id).await.unwrap().value;
    assert_eq!(resumed.status(), SessionStatus::Active);
    assert_eq!(resumed.current_index(), 1);

    svc.expire(id).await.unwrap();
    let err = svc.navigate(id, Direction::Next).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    let err = svc
        .submit_answer(id, &QuestionId::new("q1"), "A", 1)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(svc.resume(id).await.unwrap_err().kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn empty_filter_result_is_reported() {
    let durable = InMemoryRepository::new();
    let svc = service(&durable);
    let err = svc
        .create_session(NewSession::new("u1", SessionFilter::new().with_subject("S9")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoQuestionsMatched);
    assert_eq!(durable.session_count(), 0);
}

#[tokio::test]
async fn invalid_requests_are_validation_errors() {
    let durable = InMemoryRepository::new();
    let svc = service(&durable);

    let err = svc
        .create_session(NewSession::new(" ", s1()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);

    let inverted = SessionFilter {
        marks_min: Some(4.0),
        marks_max: Some(1.0),
        ..s1()
    };
    let err = svc
        .create_session(NewSession::new("u1", inverted))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);

    let err = svc
        .create_session(NewSession::new("u1", s1()).with_time_limit(0))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
}

#[tokio::test]
async fn solved_questions_can_be_excluded() {
    let durable = InMemoryRepository::new();
    let svc = service(&durable);
    let first = create(&svc, s1()).await.id();
    svc.submit_answer(first, &QuestionId::new("q1"), "A", 1)
        .await
        .unwrap();
    svc.submit_answer(first, &QuestionId::new("q2"), "nope", 1)
        .await
        .unwrap();

    let fresh = SessionFilter {
        include_solved: false,
        ..s1()
    };
    let second = create(&svc, fresh).await;
    let ids: Vec<&str> = second.question_ids().iter().map(QuestionId::as_str).collect();
    assert_eq!(ids, vec!["q2", "q3"]);

    // Another user's history does not count.
    let theirs = svc
        .create_session(NewSession::new(
            "u2",
            SessionFilter {
                include_solved: false,
                ..s1()
            },
        ))
        .await
        .unwrap()
        .value;
    assert_eq!(theirs.total_questions(), 3);
}

#[tokio::test]
async fn seeded_shuffle_is_a_frozen_permutation() {
    let durable = InMemoryRepository::new();
    let svc = service(&durable).with_config(PracticeConfig::default().with_shuffle_seed(7));
    let shuffled = SessionFilter::new().with_shuffle(true);

    let a = create(&svc, shuffled.clone()).await;
    let b = create(&svc, shuffled).await;
    assert_eq!(a.question_ids(), b.question_ids());

    let members: HashSet<&str> = a.question_ids().iter().map(QuestionId::as_str).collect();
    assert_eq!(members, HashSet::from(["q1", "x1", "q2", "q3"]));

    svc.navigate(a.id(), Direction::Next).await.unwrap();
    let stored = durable.get_session(a.id()).await.unwrap().unwrap();
    assert_eq!(stored.question_ids(), a.question_ids());
}

#[tokio::test]
async fn secondary_source_fills_an_empty_primary() {
    let durable = InMemoryRepository::new();
    let secondary = InMemoryQuestionBank::new(vec![question("s1", "S7", "Y")]);
    let svc = service(&durable).with_secondary_source(Arc::new(secondary));

    let session = create(&svc, SessionFilter::new().with_subject("S7")).await;
    assert_eq!(session.question_ids(), &[QuestionId::new("s1")]);

    let grade = svc
        .submit_answer(session.id(), &QuestionId::new("s1"), "y", 2)
        .await
        .unwrap()
        .value;
    assert!(grade.is_correct);
}

#[tokio::test]
async fn cursor_past_the_end_reports_none_left() {
    let durable = InMemoryRepository::new();
    let svc = service(&durable);
    let session = create(&svc, s1()).await;

    let parked = Session::from_persisted(
        session.id(),
        session.user_id().clone(),
        session.name().to_owned(),
        session.filter().clone(),
        session.question_ids().to_vec(),
        session.total_questions(),
        SessionStatus::Completed,
        session.start_time(),
        session.last_activity(),
        None,
        session.counters(),
    )
    .unwrap();
    durable.save_session(&parked).await.unwrap();

    match svc.get_current(session.id()).await.unwrap().value {
        CurrentQuestion::NoneLeft {
            session_completed,
            nav,
        } => {
            assert!(session_completed);
            assert_eq!(nav.current_index, 3);
            assert!(nav.has_previous);
        }
        CurrentQuestion::At(_) => panic!("cursor should be past the end"),
    }
    assert_eq!(
        svc.navigate(session.id(), Direction::Previous).await.unwrap().value,
        2
    );
}

#[tokio::test]
async fn time_limit_sets_a_deadline() {
    let durable = InMemoryRepository::new();
    let svc = service(&durable);
    let session = svc
        .create_session(NewSession::new("u1", s1()).with_name("Timed").with_time_limit(20))
        .await
        .unwrap()
        .value;
    assert_eq!(session.name(), "Timed");

    let CurrentQuestion::At(at) = svc.get_current(session.id()).await.unwrap().value else {
        panic!("expected a question");
    };
    assert_eq!(at.deadline, Some(fixed_now() + Duration::minutes(20)));
}

#[tokio::test]
async fn list_is_newest_first_with_summaries() {
    let durable = InMemoryRepository::new();
    let shared = store(&durable);
    let early = service_at(fixed_clock(), shared.clone());
    let late = service_at(Clock::fixed(fixed_now() + Duration::hours(2)), shared);

    let older = create(&early, s1()).await;
    let newer = create(&late, s1()).await;
    early
        .submit_answer(older.id(), &QuestionId::new("q1"), "A", 3)
        .await
        .unwrap();
    early.pause(older.id()).await.unwrap();

    let listed = early
        .list_sessions(&UserId::new("u1"), StatusFilter::All)
        .await
        .unwrap();
    assert!(!listed.is_fallback());
    let ids: Vec<SessionId> = listed.value.iter().map(|s| s.session_id).collect();
    assert_eq!(ids, vec![newer.id(), older.id()]);

    let summary = &listed.value[1];
    assert_eq!(summary.status, SessionStatus::Paused);
    assert_eq!(summary.questions_answered, 1);
    assert_eq!(summary.questions_correct, 1);
    assert!(!summary.is_completed);
    assert!(!summary.fallback);

    let paused = early
        .list_sessions(&UserId::new("u1"), StatusFilter::Only(SessionStatus::Paused))
        .await
        .unwrap();
    assert_eq!(paused.value.len(), 1);
}

#[tokio::test]
async fn concurrent_navigation_loses_no_updates() {
    let durable = InMemoryRepository::new();
    let bank = InMemoryQuestionBank::new(
        (0..8)
            .map(|i| question(&format!("c{i}"), "S1", "A"))
            .collect(),
    );
    let svc = PracticeService::new(fixed_clock(), store(&durable), Arc::new(bank));
    let id = create(&svc, s1()).await.id();

    let mut handles = Vec::new();
    for _ in 0..7 {
        let svc = svc.clone();
        handles.push(tokio::spawn(async move {
            svc.navigate(id, Direction::Next).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let stored = durable.get_session(id).await.unwrap().unwrap();
    assert_eq!(stored.current_index(), 7);
}
