mod common;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use common::*;
use reviewloop::controller::{DecisionOutcome, LoopController, LoopSettings, Trigger};
use reviewloop::error::{Error, Result};
use reviewloop::ledger::{ActionKind, MemoryLedger};
use reviewloop::rate_limit::{RateLimitPolicy, RateLimitScope, RateLimiter};
use reviewloop::state::{IterationRecord, IterationStore, MemoryStore, TaskStatus};

const LOGIN_FAILURE: &str = "AssertionError: expected status 200 but got 500 from /login";

#[tokio::test]
async fn test_stuck_on_third_similar_round_then_reset_and_approve() {
    let generator = MockGenerator::default();
    let ctl = controller(5, generator.clone());

    let first = ctl
        .on_trigger(&failing_trigger("gh-7", "d1", &[("test_login", LOGIN_FAILURE)]))
        .await
        .unwrap();
    assert!(matches!(first, DecisionOutcome::RepairRequested { iteration: 1, .. }));

    let second = ctl
        .on_trigger(&failing_trigger(
            "gh-7",
            "d2",
            &[("test_login", "AssertionError: expected status 200 but got 502 from /login")],
        ))
        .await
        .unwrap();
    assert!(matches!(second, DecisionOutcome::RepairRequested { iteration: 2, .. }));

    let third = ctl
        .on_trigger(&failing_trigger(
            "gh-7",
            "d3",
            &[("test_login", "AssertionError: expected status 200 but got 503 from /login")],
        ))
        .await
        .unwrap();
    match third {
        DecisionOutcome::Stuck {
            iteration,
            mean_similarity,
        } => {
            assert_eq!(iteration, 3);
            assert!(mean_similarity > 0.70);
        }
        other => panic!("expected Stuck, got {other:?}"),
    }

    let record = ctl.status("gh-7").unwrap();
    assert_eq!(record.status, TaskStatus::Stuck);
    assert_eq!(record.iteration, 3);
    assert_eq!(record.history.len(), 3);
    assert_eq!(generator.call_count(), 2);
    assert_eq!(
        ctl.reviewer().kinds(),
        vec![
            ActionKind::RepairRequested,
            ActionKind::RepairRequested,
            ActionKind::Stuck
        ]
    );

    // Sticky until reset.
    let ignored = ctl.on_trigger(&passing_trigger("gh-7", "d4")).await.unwrap();
    assert_eq!(
        ignored,
        DecisionOutcome::Ignored {
            status: TaskStatus::Stuck
        }
    );

    let fresh = ctl.reset("gh-7").await.unwrap();
    assert_eq!(fresh.status, TaskStatus::Pending);
    assert_eq!(fresh.iteration, 0);
    assert!(fresh.history.is_empty());

    let approved = ctl.on_trigger(&passing_trigger("gh-7", "d5")).await.unwrap();
    assert_eq!(approved, DecisionOutcome::Approved { iteration: 1 });
    assert_eq!(ctl.status("gh-7").unwrap().status, TaskStatus::Approved);
    assert_eq!(ctl.reviewer().count(ActionKind::Approve), 1);
}

#[tokio::test]
async fn test_max_iterations_reached_exactly_at_limit() {
    let generator = MockGenerator::default();
    let ctl = controller(5, generator.clone());
    let rounds: [(&str, &str); 5] = [
        ("test_parse_header", "ValueError: invalid literal for int() with base 10"),
        ("test_checkout_flow", "TimeoutError after 30s waiting for payment service"),
        ("test_zz", "KeyError: 'q'"),
        (
            "test_render_invoice_pdf_with_unicode_names",
            "UnicodeEncodeError: codec can't encode character in position 4",
        ),
        ("test_b", "assert 1 == 2"),
    ];

    for (i, failure) in rounds.iter().enumerate() {
        let round = i as u32 + 1;
        let outcome = ctl
            .on_trigger(&failing_trigger("gh-8", &format!("d{round}"), &[*failure]))
            .await
            .unwrap();
        if round < 5 {
            assert!(
                matches!(outcome, DecisionOutcome::RepairRequested { iteration, .. } if iteration == round),
                "round {round}: {outcome:?}"
            );
        } else {
            assert_eq!(outcome, DecisionOutcome::MaxIterationsReached { iteration: 5 });
        }
    }

    let record = ctl.status("gh-8").unwrap();
    assert_eq!(record.status, TaskStatus::MaxIterationsReached);
    assert_eq!(record.iteration, 5);
    assert_eq!(generator.call_count(), 4);
    assert_eq!(ctl.reviewer().count(ActionKind::LimitReached), 1);

    let after = ctl.on_trigger(&passing_trigger("gh-8", "d6")).await.unwrap();
    assert_eq!(
        after,
        DecisionOutcome::Ignored {
            status: TaskStatus::MaxIterationsReached
        }
    );
    assert_eq!(ctl.status("gh-8").unwrap().iteration, 5);
}

#[tokio::test]
async fn test_approve_on_first_clean_report() {
    let ctl = controller(5, MockGenerator::default());
    let outcome = ctl.on_trigger(&passing_trigger("gh-1", "d1")).await.unwrap();
    assert_eq!(outcome, DecisionOutcome::Approved { iteration: 1 });
    assert_eq!(ctl.generator().call_count(), 0);
    assert_eq!(ctl.reviewer().kinds(), vec![ActionKind::Approve]);
}

#[tokio::test]
async fn test_non_blocking_findings_still_approve() {
    let ctl = controller(5, MockGenerator::default());
    let lint = serde_json::json!({
        "errors": [{"file": "app.py", "line": 3, "code": "E501", "message": "line too long"}]
    })
    .to_string();
    let outcome = ctl
        .on_trigger(&trigger("gh-2", "d1", &[("lint", lint)]))
        .await
        .unwrap();
    assert_eq!(outcome, DecisionOutcome::Approved { iteration: 1 });
    let record = ctl.status("gh-2").unwrap();
    assert_eq!(record.latest().unwrap().findings.len(), 1);
}

/// Store whose first two loads wait for each other, so both callers see the same revision.
struct GatedStore {
    inner: MemoryStore,
    gate: Barrier,
    loads: AtomicUsize,
}

impl IterationStore for GatedStore {
    fn load(&self, task_id: &str) -> Result<IterationRecord> {
        if self.loads.fetch_add(1, Ordering::SeqCst) < 2 {
            self.gate.wait();
        }
        self.inner.load(task_id)
    }

    fn commit(&self, record: IterationRecord) -> Result<IterationRecord> {
        self.inner.commit(record)
    }

    fn reset(&self, task_id: &str) -> Result<IterationRecord> {
        self.inner.reset(task_id)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicate_triggers_advance_once() {
    let generator = MockGenerator::slow(Duration::from_millis(50));
    let ctl = Arc::new(LoopController::new(
        Arc::new(GatedStore {
            inner: MemoryStore::new(5),
            gate: Barrier::new(2),
            loads: AtomicUsize::new(0),
        }),
        Arc::new(MemoryLedger::new()),
        generous_limiter(),
        generator.clone(),
        MockReviewClient::default(),
        LoopSettings::default(),
    ));
    // No delivery id: the trigger is identified by its findings.
    let mut reports = BTreeMap::new();
    reports.insert(
        "tests".to_string(),
        test_report(&[("test_login", LOGIN_FAILURE)]),
    );
    let dup = Trigger::new("gh-9", reports);

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let ctl = Arc::clone(&ctl);
            let dup = dup.clone();
            tokio::spawn(async move { ctl.on_trigger(&dup).await })
        })
        .collect();
    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap().unwrap());
    }

    let repairs = outcomes
        .iter()
        .filter(|o| matches!(o, DecisionOutcome::RepairRequested { .. }))
        .count();
    let duplicates = outcomes
        .iter()
        .filter(|o| matches!(o, DecisionOutcome::Duplicate { iteration: 1, .. }))
        .count();
    assert_eq!((repairs, duplicates), (1, 1), "{outcomes:?}");
    assert_eq!(generator.call_count(), 1);
    assert_eq!(ctl.reviewer().count(ActionKind::RepairRequested), 1);
    let record = ctl.status("gh-9").unwrap();
    assert_eq!(record.iteration, 1);
    assert_eq!(record.history.len(), 1);
}

#[tokio::test]
async fn test_identical_findings_in_later_rounds_get_stuck() {
    let generator = MockGenerator::default();
    let ctl = controller(5, generator.clone());
    let mut reports = BTreeMap::new();
    reports.insert(
        "tests".to_string(),
        test_report(&[("test_login", LOGIN_FAILURE)]),
    );
    let run = Trigger::new("gh-14", reports);

    let mut outcomes = Vec::new();
    for _ in 0..3 {
        outcomes.push(ctl.on_trigger(&run).await.unwrap());
    }
    assert!(matches!(outcomes[0], DecisionOutcome::RepairRequested { iteration: 1, .. }));
    assert!(matches!(outcomes[1], DecisionOutcome::RepairRequested { iteration: 2, .. }));
    assert!(
        matches!(outcomes[2], DecisionOutcome::Stuck { iteration: 3, .. }),
        "{outcomes:?}"
    );

    let record = ctl.status("gh-14").unwrap();
    assert_eq!(record.status, TaskStatus::Stuck);
    assert_eq!(record.history.len(), 3);
    assert_eq!(generator.call_count(), 2);
}

/// Store that rejects the first commit as if another writer had won the race.
struct ContendedStore {
    inner: MemoryStore,
    commits: AtomicUsize,
}

impl IterationStore for ContendedStore {
    fn load(&self, task_id: &str) -> Result<IterationRecord> {
        self.inner.load(task_id)
    }

    fn commit(&self, record: IterationRecord) -> Result<IterationRecord> {
        if self.commits.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(Error::Conflict {
                task_id: record.task_id.clone(),
                expected: record.revision,
                found: record.revision + 1,
            });
        }
        self.inner.commit(record)
    }

    fn reset(&self, task_id: &str) -> Result<IterationRecord> {
        self.inner.reset(task_id)
    }
}

#[tokio::test]
async fn test_lost_commit_race_returns_limiter_slot() {
    let limiter = RateLimiter::new(
        RateLimitPolicy {
            quota: 1,
            window: Duration::from_secs(60),
            max_wait: Duration::ZERO,
        },
        RateLimitScope::Global,
    );
    let generator = MockGenerator::default();
    let ctl = LoopController::new(
        Arc::new(ContendedStore {
            inner: MemoryStore::new(5),
            commits: AtomicUsize::new(0),
        }),
        Arc::new(MemoryLedger::new()),
        limiter,
        generator.clone(),
        MockReviewClient::default(),
        LoopSettings::default(),
    );

    let outcome = ctl
        .on_trigger(&failing_trigger("gh-15", "d1", &[("test_a", "boom")]))
        .await
        .unwrap();
    assert!(
        matches!(outcome, DecisionOutcome::RepairRequested { iteration: 1, .. }),
        "{outcome:?}"
    );
    assert_eq!(generator.call_count(), 1);
}

#[tokio::test]
async fn test_redelivery_is_duplicate() {
    let ctl = controller(5, MockGenerator::default());
    let t = failing_trigger("gh-10", "same", &[("test_a", "boom")]);
    ctl.on_trigger(&t).await.unwrap();
    let again = ctl.on_trigger(&t).await.unwrap();
    assert_eq!(
        again,
        DecisionOutcome::Duplicate {
            iteration: 1,
            status: TaskStatus::InProgress
        }
    );
    assert_eq!(ctl.generator().call_count(), 1);
}

#[tokio::test]
async fn test_generator_failure_is_sticky_failed() {
    let generator = MockGenerator::failing("model overloaded");
    let ctl = controller(5, generator.clone());

    let outcome = ctl
        .on_trigger(&failing_trigger("gh-11", "d1", &[("test_a", "boom")]))
        .await
        .unwrap();
    match outcome {
        DecisionOutcome::Failed { iteration, ref error } => {
            assert_eq!(iteration, 1);
            assert!(error.contains("model overloaded"), "{error}");
        }
        other => panic!("expected Failed, got {other:?}"),
    }

    let record = ctl.status("gh-11").unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
    assert!(record.last_error.as_deref().unwrap().contains("model overloaded"));
    assert_eq!(ctl.reviewer().kinds(), vec![ActionKind::Failed]);

    let next = ctl
        .on_trigger(&failing_trigger("gh-11", "d2", &[("test_a", "boom again")]))
        .await
        .unwrap();
    assert_eq!(
        next,
        DecisionOutcome::Ignored {
            status: TaskStatus::Failed
        }
    );
    assert_eq!(generator.call_count(), 1);
    // The failure notice is not posted twice.
    assert_eq!(ctl.reviewer().count(ActionKind::Failed), 1);
}

#[tokio::test(start_paused = true)]
async fn test_generator_timeout_is_failed() {
    let ctl = LoopController::new(
        Arc::new(MemoryStore::new(5)),
        Arc::new(MemoryLedger::new()),
        generous_limiter(),
        MockGenerator::slow(Duration::from_secs(600)),
        MockReviewClient::default(),
        LoopSettings {
            generator_timeout: Duration::from_secs(5),
            ..LoopSettings::default()
        },
    );
    let outcome = ctl
        .on_trigger(&failing_trigger("gh-12", "d1", &[("test_a", "boom")]))
        .await
        .unwrap();
    match outcome {
        DecisionOutcome::Failed { ref error, .. } => assert!(error.contains("timed out"), "{error}"),
        other => panic!("expected Failed, got {other:?}"),
    }
    assert_eq!(ctl.status("gh-12").unwrap().status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_publish_failure_is_failed() {
    let reviewer = MockReviewClient {
        fail: true,
        ..Default::default()
    };
    let ctl = controller_with(5, MockGenerator::default(), reviewer, generous_limiter());
    let outcome = ctl.on_trigger(&passing_trigger("gh-13", "d1")).await.unwrap();
    match outcome {
        DecisionOutcome::Failed { ref error, .. } => assert!(error.contains("HTTP 502")),
        other => panic!("expected Failed, got {other:?}"),
    }
    let record = ctl.status("gh-13").unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
    assert!(record.last_error.is_some());
}

#[tokio::test]
async fn test_rate_limit_exceeded_commits_nothing() {
    let limiter = RateLimiter::new(
        RateLimitPolicy {
            quota: 1,
            window: Duration::from_secs(60),
            max_wait: Duration::from_secs(1),
        },
        RateLimitScope::Global,
    );
    let generator = MockGenerator::default();
    let ctl = controller_with(5, generator.clone(), MockReviewClient::default(), limiter);

    let first = ctl
        .on_trigger(&failing_trigger("gh-20", "d1", &[("test_a", "boom")]))
        .await
        .unwrap();
    assert!(matches!(first, DecisionOutcome::RepairRequested { .. }));

    let err = ctl
        .on_trigger(&failing_trigger("gh-21", "d1", &[("test_b", "bang")]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RateLimitExceeded { .. }));
    assert!(err.is_retryable());

    let untouched = ctl.status("gh-21").unwrap();
    assert_eq!(untouched.status, TaskStatus::Pending);
    assert_eq!(untouched.iteration, 0);
    assert!(untouched.history.is_empty());
    assert_eq!(generator.call_count(), 1);
}

#[tokio::test]
async fn test_malformed_source_is_dropped() {
    let ctl = controller(5, MockGenerator::default());
    let outcome = ctl
        .on_trigger(&trigger(
            "gh-30",
            "d1",
            &[
                ("tests", "{not json".to_string()),
                ("types", serde_json::json!({"errors": [
                    {"file": "app.py", "line": 9, "message": "Incompatible return type", "severity": "error"}
                ]}).to_string()),
            ],
        ))
        .await
        .unwrap();
    assert!(matches!(outcome, DecisionOutcome::RepairRequested { iteration: 1, .. }));

    let record = ctl.status("gh-30").unwrap();
    let snapshot = record.latest().unwrap();
    assert_eq!(snapshot.findings.len(), 1);
    assert_eq!(snapshot.findings[0].source, "types");
}

#[tokio::test]
async fn test_invalid_task_id_rejected() {
    let ctl = controller(5, MockGenerator::default());
    let err = ctl
        .on_trigger(&passing_trigger("../etc", "d1"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TaskId(_)));
}
