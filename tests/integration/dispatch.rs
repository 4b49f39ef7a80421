//! Fan-out integration tests.
//!
//! These tests verify that a batch always yields one candidate per slot and
//! that timed-out slots drop out of evaluation without affecting siblings.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use gauntlet::config::HealthConfig;
use gauntlet::core::{CandidateId, CandidateStatus, Language, TaskKind};
use gauntlet::orchestration::{Batch, DispatchTarget, Dispatcher, HealthTable};
use gauntlet::worker::{Priority, WorkerId, WorkerRole};
use gauntlet::RunOutcome;

use crate::fixtures::{design_doc, run, task, Behavior, Harness, MockWorker};

/// Test: Fanout count
/// Given a worker where one slot crashes and one hangs
/// When a batch of five is dispatched
/// Then exactly five candidates come back, ordered by slot
#[tokio::test]
async fn test_fanout_count_regardless_of_failures() {
    let dir = TempDir::new().unwrap();
    let health = Arc::new(HealthTable::new(1, HealthConfig::default()));
    let dispatcher = Dispatcher::new(Arc::clone(&health), dir.path().to_path_buf());
    let worker = Arc::new(
        MockWorker::replying("gad", "# Design\nbody")
            .slot(1, Behavior::Fail)
            .slot(3, Behavior::Hang),
    );
    let target = DispatchTarget {
        id: WorkerId(0),
        name: "gad".to_string(),
        priority: Priority::Primary,
        handle: worker.clone(),
    };
    let batch = Batch {
        number: 0,
        fanout: 5,
        timeout: Duration::from_millis(300),
    };

    let started = Instant::now();
    let candidates = dispatcher
        .dispatch("payload", &target, batch, &CancellationToken::new())
        .await;

    assert_eq!(candidates.len(), 5);
    assert!(started.elapsed() < Duration::from_secs(10), "hung slot must be cut off");
    for (slot, c) in candidates.iter().enumerate() {
        assert_eq!(c.id, CandidateId::new(0, slot as u32));
    }
    assert!(matches!(candidates[1].status, CandidateStatus::Failed { .. }));
    assert_eq!(candidates[3].status, CandidateStatus::TimedOut);
    assert_eq!(candidates.iter().filter(|c| c.is_succeeded()).count(), 3);
    assert_eq!(worker.calls(), 5);

    let snapshot = health.snapshot(WorkerId(0)).unwrap();
    assert_eq!(snapshot.successes, 3);
    assert_eq!(snapshot.failures, 1);
    assert_eq!(snapshot.timeouts, 1);
}

/// Test: Every slot gets the same payload and its own workspace
#[tokio::test]
async fn test_slots_are_isolated() {
    let dir = TempDir::new().unwrap();
    let health = Arc::new(HealthTable::new(1, HealthConfig::default()));
    let dispatcher = Dispatcher::new(health, dir.path().to_path_buf());
    let worker = Arc::new(MockWorker::replying("gad", "# Design\nbody"));
    let target = DispatchTarget {
        id: WorkerId(0),
        name: "gad".to_string(),
        priority: Priority::Primary,
        handle: worker.clone(),
    };
    let batch = Batch {
        number: 2,
        fanout: 3,
        timeout: Duration::from_secs(1),
    };

    let candidates = dispatcher
        .dispatch("same payload", &target, batch, &CancellationToken::new())
        .await;

    assert!(worker.payloads().iter().all(|p| p == "same payload"));
    let mut paths: Vec<_> = candidates
        .iter()
        .filter_map(|c| c.scratch_path.clone())
        .collect();
    paths.sort();
    paths.dedup();
    assert_eq!(paths.len(), 3);
    for path in &paths {
        assert_eq!(std::fs::read_to_string(path).unwrap(), "# Design\nbody");
    }
}

/// Test: fanout=5, 2 timeout, 3 succeed, min-success=1
/// Given a primary worker whose slots 1 and 3 hang
/// When the task runs
/// Then the evaluator ranks three candidates, one is placed, two are archived
#[tokio::test]
async fn test_five_dispatched_two_time_out() {
    let host = Arc::new(MockWorker::failing("host"));
    let gad = Arc::new(
        MockWorker::new("gad", Behavior::Fail)
            .slot(0, Behavior::Reply(design_doc("Timer A", 0.4, &["Overview"])))
            .slot(1, Behavior::Hang)
            .slot(2, Behavior::Reply(design_doc("Timer B", 0.9, &["Overview"])))
            .slot(3, Behavior::Hang)
            .slot(4, Behavior::Reply(design_doc("Timer C", 0.6, &["Overview"]))),
    );
    let mut harness = Harness::new(host.clone());
    harness.config.kinds.design.fanout = 5;
    harness.config.min_successes = 1;
    harness.register(WorkerRole::Architect, Some(Language::Go), gad.clone());
    let (orch, _dir, scorer) = harness.build_auto();

    let outcome = run(&orch, task(TaskKind::Design, Some(Language::Go))).await;
    let RunOutcome::Placed(placed) = outcome else {
        panic!("expected placement, got {outcome:?}");
    };

    assert_eq!(placed.attempts.len(), 1);
    assert_eq!(placed.attempts[0].fanout, 5);
    assert_eq!(placed.attempts[0].succeeded, 3);
    assert_eq!(
        placed.attempts[0]
            .failures
            .iter()
            .filter(|f| f.ends_with("timed out"))
            .count(),
        2
    );
    assert_eq!(scorer.rounds.load(Ordering::SeqCst), 1);
    assert_eq!(placed.candidate, CandidateId::new(0, 2));
    assert_eq!(placed.archived, 2);
    assert_eq!(host.calls(), 0);

    let history = orch.store().history(Some(TaskKind::Design)).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].record_count, 2);
    assert_eq!(history[0].placed, Some(CandidateId::new(0, 2)));
}
