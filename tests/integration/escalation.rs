//! Escalation integration tests.
//!
//! These tests verify that failing batches walk the resolved worker list in
//! order, that the host agent is always the last resort, and that a run only
//! fails once that list is exhausted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use gauntlet::core::{Language, TaskKind};
use gauntlet::orchestration::{AttemptOutcome, FailureReason, Preferences, RunEvent, RunState};
use gauntlet::worker::{Priority, WorkerRole};
use gauntlet::{Error, RunOutcome};

use crate::fixtures::{design_doc, go_fallback, run, task, Behavior, Harness, MockWorker};

/// Test: Escalation bound
/// Given a primary, a designated fallback, a generic worker and a host
/// that all fail
/// When the task runs
/// Then each is tried once in resolution order and the run fails only after
/// the host
#[tokio::test]
async fn test_escalation_bounded_by_resolved_list() {
    let host = Arc::new(MockWorker::failing("host"));
    let gad = Arc::new(MockWorker::failing("gad"));
    let fallback = Arc::new(MockWorker::failing("gofallback"));
    let generic = Arc::new(MockWorker::failing("architect"));

    let mut harness = Harness::new(host.clone());
    harness.config.kinds.design.fanout = 2;
    go_fallback(&mut harness.config, "gofallback");
    harness
        .register(WorkerRole::Architect, Some(Language::Go), gad.clone())
        .register(WorkerRole::Architect, Some(Language::Rust), fallback.clone())
        .register(WorkerRole::Architect, None, generic.clone());
    let (orch, _dir, _) = harness.build_auto();

    let resolved = orch
        .resolver()
        .resolve(Some(Language::Go), TaskKind::Design, &Preferences::default());
    assert_eq!(resolved.len(), 4);

    let outcome = run(&orch, task(TaskKind::Design, Some(Language::Go))).await;
    let RunOutcome::Failed(report) = outcome.clone() else {
        panic!("expected failure, got {outcome:?}");
    };

    assert_eq!(report.reason, FailureReason::ExhaustedResolution);
    assert_eq!(report.workers_tried(), ["gad", "gofallback", "architect", "host"]);
    assert!(report.workers_tried().len() <= resolved.len());
    let priorities: Vec<Priority> = report.attempts.iter().map(|a| a.priority).collect();
    assert_eq!(
        priorities,
        [Priority::Primary, Priority::Fallback, Priority::Generic, Priority::Host]
    );
    assert!(report
        .attempts
        .iter()
        .all(|a| matches!(a.outcome, AttemptOutcome::InsufficientSuccesses { .. })));
    assert_eq!(report.attempts[3].fanout, 1);
    assert_eq!(host.calls(), 1);
    assert_eq!(report.archived, 0);
    assert!(report.summary().contains("gad crashed"));

    match outcome.into_result() {
        Err(Error::ExhaustedResolution(boxed)) => assert_eq!(boxed.attempts.len(), 4),
        other => panic!("expected ExhaustedResolution, got {other:?}"),
    }
}

/// Test: Insufficient successes escalate
/// Given min_successes=2 and a primary worker with a single success
/// When the task runs
/// Then the run escalates and the lone success is archived, not lost
#[tokio::test]
async fn test_insufficient_successes_escalate() {
    let gad = Arc::new(
        MockWorker::failing("gad").slot(0, Behavior::Reply(design_doc("Lone", 0.99, &["Overview"]))),
    );
    let generic = Arc::new(MockWorker::replying(
        "architect",
        &design_doc("Generic", 0.5, &["Overview"]),
    ));

    let mut harness = Harness::new(Arc::new(MockWorker::failing("host")));
    harness.config.kinds.design.fanout = 3;
    harness.config.min_successes = 2;
    harness
        .register(WorkerRole::Architect, Some(Language::Go), gad.clone())
        .register(WorkerRole::Architect, None, generic.clone());
    let (orch, _dir, scorer) = harness.build_auto();

    let placed = run(&orch, task(TaskKind::Design, Some(Language::Go)))
        .await
        .into_result()
        .unwrap();

    assert_eq!(
        placed.attempts[0].outcome,
        AttemptOutcome::InsufficientSuccesses {
            succeeded: 1,
            required: 2
        }
    );
    assert_eq!(placed.worker, "architect");
    // Only the generic batch reached the evaluator.
    assert_eq!(scorer.rounds.load(std::sync::atomic::Ordering::SeqCst), 1);
    // One from the primary batch plus two losing generic candidates.
    assert_eq!(placed.archived, 3);
}

/// Test: Unavailable workers are not resolved
#[tokio::test]
async fn test_unavailable_worker_skipped() {
    let gad = Arc::new(MockWorker::replying("gad", "# Primary\nbody"));
    let generic = Arc::new(MockWorker::replying("architect", "# Generic\nbody"));

    let mut harness = Harness::new(Arc::new(MockWorker::failing("host")));
    harness.config.kinds.design.fanout = 1;
    harness
        .register(WorkerRole::Architect, Some(Language::Go), gad.clone())
        .register(WorkerRole::Architect, None, generic.clone());
    let (orch, _dir, _) = harness.build_auto();

    let gad_id = orch.registry().id_of("gad").unwrap();
    orch.health().mark_unavailable(gad_id);

    let placed = run(&orch, task(TaskKind::Design, Some(Language::Go)))
        .await
        .into_result()
        .unwrap();
    assert_eq!(placed.worker, "architect");
    assert_eq!(gad.calls(), 0);
    assert_eq!(&placed.states[..2], [RunState::Resolving, RunState::Dispatching]);
    assert!(!placed.states.contains(&RunState::Escalating));
}

/// Test: Progress events follow the run
#[tokio::test]
async fn test_events_report_escalation() {
    let mut harness = Harness::new(Arc::new(MockWorker::replying("host", "# Host\nbody")));
    harness.config.kinds.design.fanout = 2;
    harness.register(
        WorkerRole::Architect,
        Some(Language::Go),
        Arc::new(MockWorker::failing("gad")),
    );
    let (orch, _dir, _) = harness.build_auto();
    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    let orch = orch.with_events(tx);

    let placed = run(&orch, task(TaskKind::Design, Some(Language::Go)))
        .await
        .into_result()
        .unwrap();
    assert_eq!(placed.worker, "host");

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::Escalated { from, to, .. } if from == "gad" && to == "host"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::State { to: RunState::Done, .. }
    )));
    let batches = events
        .iter()
        .filter(|e| matches!(e, RunEvent::BatchFinished { .. }))
        .count();
    assert_eq!(batches, 2);
}

/// Test: Cancellation stops in-flight invocations
#[tokio::test]
async fn test_cancel_stops_hung_batch() {
    let gad = Arc::new(MockWorker::new("gad", Behavior::Hang));
    let mut harness = Harness::new(Arc::new(MockWorker::failing("host")));
    harness.config.kinds.design.timeout_secs = 30;
    harness.register(WorkerRole::Architect, Some(Language::Go), gad);
    let (orch, _dir, _) = harness.build_auto();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let outcome = orch
        .run(task(TaskKind::Design, Some(Language::Go)), cancel)
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    let RunOutcome::Failed(report) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(report.reason, FailureReason::Cancelled);
    assert_eq!(report.workers_tried(), ["gad"]);
}
