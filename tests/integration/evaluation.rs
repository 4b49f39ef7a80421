//! Evaluation integration tests.
//!
//! These tests verify winner selection: only succeeded, structurally valid
//! candidates win, ties break the same way every time, and a batch whose
//! candidates all fail the outline escalates to the next worker.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use gauntlet::core::{Candidate, CandidateId, CandidateStatus, Language, TaskKind};
use gauntlet::evaluation::{Evaluator, Outline, Rubric, Scorer};
use gauntlet::orchestration::AttemptOutcome;
use gauntlet::worker::{Priority, WorkerId, WorkerRole};
use gauntlet::RunOutcome;

use crate::fixtures::{design_doc, go_fallback, run, task, Behavior, Harness, MarkerScorer, MockWorker};

fn candidate(batch: u32, slot: u32, priority: Priority, status: CandidateStatus, content: &str) -> Candidate {
    Candidate {
        id: CandidateId::new(batch, slot),
        worker: WorkerId(slot as usize),
        worker_name: format!("w{slot}"),
        priority,
        status,
        content: content.to_string(),
        started_at: Utc::now(),
        elapsed: Duration::from_millis(10),
        scratch_path: None,
    }
}

fn evaluator() -> Evaluator {
    Evaluator::new(Arc::new(MarkerScorer::default()) as Arc<dyn Scorer>)
}

/// Test: Tie-break determinism
/// Given candidates with identical weighted scores
/// When evaluation runs repeatedly on the same input
/// Then the same candidate wins every time: higher priority, else lower slot
#[tokio::test]
async fn test_tie_break_is_deterministic() {
    let dir = TempDir::new().unwrap();
    let t = task(TaskKind::Design, None);
    let rubric = Rubric::for_kind(TaskKind::Design);
    let eval = evaluator();
    let text = design_doc("Same", 0.7, &["Overview"]);

    let by_priority = vec![
        candidate(0, 0, Priority::Generic, CandidateStatus::Succeeded, &text),
        candidate(0, 1, Priority::Fallback, CandidateStatus::Succeeded, &text),
        candidate(0, 2, Priority::Generic, CandidateStatus::Succeeded, &text),
    ];
    let by_slot = vec![
        candidate(0, 3, Priority::Primary, CandidateStatus::Succeeded, &text),
        candidate(0, 1, Priority::Primary, CandidateStatus::Succeeded, &text),
        candidate(0, 2, Priority::Primary, CandidateStatus::Succeeded, &text),
    ];

    for _ in 0..10 {
        let result = eval.evaluate(&t, &by_priority, &rubric, dir.path()).await;
        assert_eq!(result.selected().map(|r| r.id), Some(CandidateId::new(0, 1)));

        let result = eval.evaluate(&t, &by_slot, &rubric, dir.path()).await;
        assert_eq!(result.selected().map(|r| r.id), Some(CandidateId::new(0, 1)));
    }
}

/// Test: Selected candidates succeeded and passed the gate
/// Given a batch mixing failures, a high-scoring outline violation and
/// valid candidates
/// When it is evaluated
/// Then the winner is a succeeded candidate whose structure matches
#[tokio::test]
async fn test_selected_candidate_succeeded_and_passed_gate() {
    let dir = TempDir::new().unwrap();
    let mut t = task(TaskKind::Elaboration, None);
    t.outline = Some(Outline::new(2, &["Overview", "Interfaces"]));
    let rubric = Rubric::for_kind(TaskKind::Elaboration);

    let batch = vec![
        candidate(
            0,
            0,
            Priority::Primary,
            CandidateStatus::Failed {
                reason: "crashed".to_string(),
            },
            "",
        ),
        candidate(
            0,
            1,
            Priority::Primary,
            CandidateStatus::Succeeded,
            &design_doc("Best but wrong", 0.95, &["Overview"]),
        ),
        candidate(0, 2, Priority::Primary, CandidateStatus::TimedOut, ""),
        candidate(
            0,
            3,
            Priority::Primary,
            CandidateStatus::Succeeded,
            &design_doc("Valid", 0.6, &["Overview", "Interfaces"]),
        ),
        candidate(
            0,
            4,
            Priority::Primary,
            CandidateStatus::Succeeded,
            &design_doc("Valid too", 0.5, &["Overview", "Interfaces"]),
        ),
    ];

    let result = evaluator().evaluate(&t, &batch, &rubric, dir.path()).await;
    let winner = result.selected().expect("a winner");
    assert_eq!(winner.id, CandidateId::new(0, 3));
    assert!(winner.structural.as_ref().is_some_and(|s| s.passed()));
    let chosen = batch.iter().find(|c| c.id == winner.id).unwrap();
    assert!(chosen.is_succeeded());

    // Ranked but never selectable.
    let wrong = result.get(CandidateId::new(0, 1)).unwrap();
    assert!(wrong.disqualified());
    assert_eq!(result.ranking.len(), 3);
}

/// Test: fanout=3, outline of 3 sections, 2 candidates omit a section
/// Given a primary worker whose two successful candidates each miss a
/// required section
/// When the task runs
/// Then evaluation has no winner and the run escalates to the fallback worker
#[tokio::test]
async fn test_outline_violation_escalates_to_fallback() {
    let sections = ["Overview", "Components", "Risks"];
    let host = Arc::new(MockWorker::failing("host"));
    let gad = Arc::new(
        MockWorker::new("gad", Behavior::Fail)
            .slot(0, Behavior::Reply(design_doc("A", 0.9, &["Overview", "Components"])))
            .slot(1, Behavior::Reply(design_doc("B", 0.8, &["Overview", "Risks"]))),
    );
    let fallback = Arc::new(MockWorker::replying(
        "gofallback",
        &design_doc("Fallback", 0.7, &sections),
    ));

    let mut harness = Harness::new(host.clone());
    harness.config.kinds.elaboration.fanout = 3;
    go_fallback(&mut harness.config, "gofallback");
    harness
        .register(WorkerRole::Architect, Some(Language::Go), gad.clone())
        .register(WorkerRole::Architect, Some(Language::Rust), fallback.clone());
    let (orch, _dir, _scorer) = harness.build_auto();

    let mut t = task(TaskKind::Elaboration, Some(Language::Go));
    t.outline = Some(Outline::new(2, &sections));
    let outcome = run(&orch, t).await;
    let RunOutcome::Placed(placed) = outcome else {
        panic!("expected placement, got {outcome:?}");
    };

    assert_eq!(placed.attempts.len(), 2);
    assert_eq!(placed.attempts[0].worker, "gad");
    assert_eq!(placed.attempts[0].succeeded, 2);
    assert!(matches!(
        placed.attempts[0].outcome,
        AttemptOutcome::NoWinner { .. }
    ));
    assert_eq!(placed.attempts[1].worker, "gofallback");
    assert_eq!(placed.attempts[1].priority, Priority::Fallback);
    assert_eq!(placed.worker, "gofallback");
    assert_eq!(host.calls(), 0);

    // The fallback batch is told why the first one was turned down.
    assert!(gad.payloads().iter().all(|p| !p.contains("previous attempt")));
    let retried = fallback.payloads();
    assert_eq!(retried.len(), 3);
    assert!(retried
        .iter()
        .all(|p| p.contains("Candidate b0-s0 had the wrong structure (missing: risks)")));

    // The two disqualified candidates plus two losing fallback candidates.
    assert_eq!(placed.archived, 4);
    let placed_text = orch.store().read_artifact(&placed.key).unwrap().unwrap();
    assert!(placed_text.contains("# Fallback"));
}
