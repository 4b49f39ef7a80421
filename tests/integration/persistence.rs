//! Persistence integration tests.
//!
//! These tests verify placement, archival and the approval round trip
//! through a full orchestrator run on a temporary storage root.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use gauntlet::core::{CandidateId, Language, TaskKind};
use gauntlet::orchestration::{AttemptOutcome, FailureReason, RunState};
use gauntlet::persistence::{ApprovalDecision, ScriptedApproval};
use gauntlet::worker::WorkerRole;
use gauntlet::RunOutcome;

use crate::fixtures::{design_doc, run, task, Behavior, Harness, MockWorker};

/// Three design candidates scored 0.9, 0.6 and 0.3 by slot.
fn ranked_gad() -> Arc<MockWorker> {
    Arc::new(
        MockWorker::new("gad", Behavior::Fail)
            .slot(0, Behavior::Reply(design_doc("First", 0.9, &["Overview"])))
            .slot(1, Behavior::Reply(design_doc("Second", 0.6, &["Overview"])))
            .slot(2, Behavior::Reply(design_doc("Third", 0.3, &["Overview"]))),
    )
}

fn harness_with(gad: Arc<MockWorker>) -> Harness {
    let mut harness = Harness::new(Arc::new(MockWorker::failing("host")));
    harness.config.kinds.design.fanout = 3;
    harness.register(WorkerRole::Architect, Some(Language::Go), gad);
    harness
}

/// Test: Placement fails due to an unwritable target
/// Given a storage root whose plan directory cannot be created
/// When the run reaches placement
/// Then the outcome is placement_failed, scratch survives, nothing is archived
/// And a retry after the fault clears places the same content
#[tokio::test]
async fn test_placement_failure_then_retry() {
    let harness = harness_with(ranked_gad());
    let store = harness.store();
    std::fs::create_dir_all(store.root()).unwrap();
    std::fs::write(store.plan_dir(), "not a directory").unwrap();
    let (orch, _dir, _scorer) = harness.build_auto();

    let outcome = run(&orch, task(TaskKind::Design, Some(Language::Go))).await;
    let RunOutcome::PlacementFailed { pending, error } = outcome else {
        panic!("expected placement failure, got {outcome:?}");
    };
    assert!(!error.is_empty());
    assert_eq!(pending.state(), RunState::Persisting);
    assert_eq!(pending.candidate, CandidateId::new(0, 0));

    // Cleanup has not run: every succeeded candidate is still in scratch.
    assert!(pending.run.scratch.is_dir());
    for c in pending.run.succeeded() {
        let path = c.scratch_path.as_ref().unwrap();
        assert!(path.exists(), "{} should remain", path.display());
    }
    assert!(store.history(None).unwrap().is_empty());
    assert_eq!(store.read_artifact(&pending.run.task.key).unwrap(), None);

    let expected = pending.run.candidate(pending.candidate).unwrap().content.clone();
    let scratch = pending.run.scratch.clone();
    std::fs::remove_file(store.plan_dir()).unwrap();

    let retried = orch.retry_placement(*pending).await.unwrap();
    let RunOutcome::Placed(placed) = retried else {
        panic!("expected placement on retry, got {retried:?}");
    };
    assert_eq!(placed.candidate, CandidateId::new(0, 0));
    assert_eq!(placed.archived, 2);
    assert_eq!(placed.states.last(), Some(&RunState::Done));
    assert_eq!(store.read_artifact(&placed.key).unwrap().unwrap(), expected);
    assert!(!scratch.exists());
}

/// Test: Cleanup fault after placement
/// Given a storage root whose archive directory cannot be created
/// When the run places its winner
/// Then the run still ends placed and Done, with the cleanup error reported
#[tokio::test]
async fn test_archive_fault_after_placement_still_done() {
    let harness = harness_with(ranked_gad());
    let store = harness.store();
    std::fs::create_dir_all(store.root()).unwrap();
    std::fs::write(store.archive_dir(), "not a directory").unwrap();
    let (orch, _dir, _scorer) = harness.build_auto();

    let outcome = run(&orch, task(TaskKind::Design, Some(Language::Go))).await;
    let RunOutcome::Placed(placed) = outcome else {
        panic!("expected placement, got {outcome:?}");
    };
    assert_eq!(placed.candidate, CandidateId::new(0, 0));
    assert_eq!(placed.states.last(), Some(&RunState::Done));
    assert_eq!(placed.archived, 0);
    assert!(placed.cleanup_error.is_some());
    let text = store.read_artifact(&placed.key).unwrap().unwrap();
    assert!(text.starts_with("# First"));
}

/// Test: Idempotent placement
/// Given two identical runs, one with a placement fault that is retried
/// When both finish
/// Then both place byte-identical artifacts
#[tokio::test]
async fn test_retry_matches_first_time_placement() {
    let clean = harness_with(ranked_gad());
    let (orch, _clean_dir, _) = clean.build_auto();
    let first = run(&orch, task(TaskKind::Design, Some(Language::Go)))
        .await
        .into_result()
        .unwrap();
    let first_text = orch.store().read_artifact(&first.key).unwrap().unwrap();

    let faulty = harness_with(ranked_gad());
    let store = faulty.store();
    std::fs::create_dir_all(store.root()).unwrap();
    std::fs::write(store.plan_dir(), "").unwrap();
    let (orch, _faulty_dir, _) = faulty.build_auto();
    let RunOutcome::PlacementFailed { pending, .. } =
        run(&orch, task(TaskKind::Design, Some(Language::Go))).await
    else {
        panic!("expected placement failure");
    };
    std::fs::remove_file(store.plan_dir()).unwrap();
    let second = orch
        .retry_placement(*pending)
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert_eq!(store.read_artifact(&second.key).unwrap().unwrap(), first_text);
    assert_eq!(second.candidate, first.candidate);
}

/// Test: Archival completeness
/// Given a design run regenerated once before approval
/// When it reaches Done
/// Then archived records plus the placed artifact equal the succeeded count
#[tokio::test]
async fn test_archival_completeness_across_batches() {
    let gad = Arc::new(
        MockWorker::replying("gad", &design_doc("Plan", 0.5, &["Overview"])).slot(2, Behavior::Fail),
    );
    let mut harness = harness_with(gad.clone());
    harness.config.kinds.design.approval_required = true;
    let approval = Arc::new(ScriptedApproval::new([ApprovalDecision::Regenerate]));
    let (orch, _dir, _) = harness.build(approval.clone());

    let placed = run(&orch, task(TaskKind::Design, Some(Language::Go)))
        .await
        .into_result()
        .unwrap();

    let succeeded: usize = placed.attempts.iter().map(|a| a.succeeded).sum();
    assert_eq!(succeeded, 4);
    assert_eq!(placed.attempts[0].outcome, AttemptOutcome::Regenerated);
    assert_eq!(placed.candidate, CandidateId::new(1, 0));
    assert_eq!(approval.requests().len(), 2);
    assert_eq!(gad.calls(), 6);
    let payloads = gad.payloads();
    assert!(payloads[..3].iter().all(|p| !p.contains("previous attempt")));
    assert!(payloads[3..]
        .iter()
        .all(|p| p.contains("The reviewer asked for a new attempt.")));

    let history = orch.store().history(Some(TaskKind::Design)).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].record_count + 1, succeeded);
    assert_eq!(placed.archived + 1, succeeded);
    for id in &history[0].records {
        let record = orch
            .store()
            .read_archive_record(TaskKind::Design, &history[0].run, *id)
            .unwrap();
        assert!(!record.content.is_empty());
        assert_ne!(record.candidate, placed.candidate);
    }
}

/// Test: approvalRequired=true, operator issues pick-alternate(2)
/// Given three ranked design candidates
/// When the operator picks slot 2 instead of the top pick
/// Then candidate 2's content is placed
#[tokio::test]
async fn test_pick_alternate_places_chosen_candidate() {
    let mut harness = harness_with(ranked_gad());
    harness.config.kinds.design.approval_required = true;
    let approval = Arc::new(ScriptedApproval::new([ApprovalDecision::PickAlternate(2)]));
    let (orch, _dir, _) = harness.build(approval.clone());

    let placed = run(&orch, task(TaskKind::Design, Some(Language::Go)))
        .await
        .into_result()
        .unwrap();

    let requests = approval.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].selected, CandidateId::new(0, 0));
    assert!(requests[0].alternatives.iter().any(|a| a.slot == 2));

    assert_eq!(placed.candidate, CandidateId::new(0, 2));
    assert!(placed.states.contains(&RunState::AwaitingApproval));
    let text = orch.store().read_artifact(&placed.key).unwrap().unwrap();
    assert!(text.starts_with("# Third"));
    let meta = orch.store().read_metadata(&placed.key).unwrap().unwrap();
    assert_eq!(meta.candidate, CandidateId::new(0, 2));
    assert_eq!(meta.worker, "gad");
}

/// Test: Rejection keeps every candidate for recovery
#[tokio::test]
async fn test_reject_archives_all_and_places_nothing() {
    let mut harness = harness_with(ranked_gad());
    harness.config.kinds.design.approval_required = true;
    let approval = Arc::new(ScriptedApproval::new([ApprovalDecision::Reject]));
    let (orch, _dir, _) = harness.build(approval);

    let t = task(TaskKind::Design, Some(Language::Go));
    let key = t.key.clone();
    let outcome = run(&orch, t).await;
    let RunOutcome::Failed(report) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };

    assert!(matches!(report.reason, FailureReason::Rejected(_)));
    assert_eq!(report.archived, 3);
    assert!(report.archive_dir.as_ref().is_some_and(|d| d.is_dir()));
    assert_eq!(orch.store().read_artifact(&key).unwrap(), None);
    let scratch_left = std::fs::read_dir(orch.store().scratch_root())
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(scratch_left, 0);
}

/// Test: Cancellation while waiting for approval
#[tokio::test]
async fn test_cancel_during_approval() {
    struct Never;

    #[async_trait::async_trait]
    impl gauntlet::persistence::ApprovalChannel for Never {
        async fn decide(
            &self,
            _request: &gauntlet::persistence::ApprovalRequest,
        ) -> gauntlet::Result<ApprovalDecision> {
            std::future::pending().await
        }
    }

    let mut harness = harness_with(ranked_gad());
    harness.config.kinds.design.approval_required = true;
    let (orch, _dir, _) = harness.build(Arc::new(Never));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let outcome = orch
        .run(task(TaskKind::Design, Some(Language::Go)), cancel)
        .await
        .unwrap();
    let RunOutcome::Failed(report) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(report.reason, FailureReason::Cancelled);
    assert_eq!(report.archived, 3);
}
