//! Persistence Manager.
//!
//! Four stages for one run:
//!
//! 1. Generation: every ranked candidate still has its scratch file.
//! 2. Selection: the evaluator's pick, or the approver's decision.
//! 3. Placement: atomic replace of the permanent artifact for the task key.
//! 4. Cleanup: archive every other succeeded candidate of the run and
//!    remove the run's scratch directory.
//!
//! A placement failure skips cleanup, leaving scratch intact so placement
//! can be retried alone. A cleanup failure after a successful placement does
//! not undo it: the run is still placed and the cleanup error is reported
//! alongside.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::{Candidate, CandidateId, Task};
use crate::error::{Error, Result};
use crate::evaluation::{EvaluationResult, RankedCandidate};
use crate::persistence::approval::{Alternative, ApprovalChannel, ApprovalDecision, ApprovalRequest};
use crate::persistence::store::{run_label, ArchiveIndex, ArchiveRecord, PlacementMetadata, Store};
use crate::util::{blocking, preview};

const PREVIEW_CHARS: usize = 600;

/// Everything one run produced, across all of its batches.
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    pub task: Task,
    pub label: String,
    pub started_at: DateTime<Utc>,
    pub scratch: PathBuf,
    pub candidates: Vec<Candidate>,
    /// Latest evaluation entry per scored candidate.
    pub scores: HashMap<CandidateId, RankedCandidate>,
}

impl RunArtifacts {
    pub fn new(task: Task, started_at: DateTime<Utc>, store: &Store) -> Self {
        let label = run_label(started_at, &task.id);
        let scratch = store.scratch_dir(&label);
        Self {
            task,
            label,
            started_at,
            scratch,
            candidates: Vec::new(),
            scores: HashMap::new(),
        }
    }

    pub fn add_batch(&mut self, batch: &[Candidate]) {
        self.candidates.extend_from_slice(batch);
    }

    pub fn add_evaluation(&mut self, eval: &EvaluationResult) {
        for r in &eval.ranking {
            self.scores.insert(r.id, r.clone());
        }
    }

    pub fn candidate(&self, id: CandidateId) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.id == id)
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.iter().filter(|c| c.is_succeeded())
    }

    fn archive_records(&self, placed: Option<CandidateId>) -> Vec<ArchiveRecord> {
        self.succeeded()
            .filter(|c| Some(c.id) != placed)
            .map(|c| {
                let ranked = self.scores.get(&c.id);
                ArchiveRecord {
                    task_id: self.task.id,
                    key: self.task.key.clone(),
                    kind: self.task.kind,
                    candidate: c.id,
                    worker: c.worker_name.clone(),
                    priority: c.priority,
                    score: ranked.map(|r| r.total),
                    criteria: ranked.map(|r| r.criteria.clone()).unwrap_or_default(),
                    rationale: ranked.map(|r| r.rationale.clone()).unwrap_or_default(),
                    disqualified: ranked.is_some_and(|r| r.disqualified()),
                    run_timestamp: self.started_at,
                    content: c.content.clone(),
                }
            })
            .collect()
    }
}

/// Result of the selection stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Approved(CandidateId),
    Regenerate,
    Rejected(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PersistenceOutcome {
    Placed {
        artifact: PathBuf,
        candidate: CandidateId,
        archived: usize,
        /// Archiving or scratch removal failed after the artifact was placed.
        cleanup_error: Option<String>,
    },
    /// Nothing was cleaned up; placement may be retried.
    PlacementFailed { candidate: CandidateId, error: String },
    /// The approver asked for a new batch.
    Regenerate,
    /// Rejected or cancelled; every succeeded candidate was archived.
    Aborted { reason: String, archived: usize },
}

pub struct PersistenceManager {
    store: Store,
    approval: Arc<dyn ApprovalChannel>,
    max_rounds: usize,
}

impl std::fmt::Debug for PersistenceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceManager")
            .field("store", &self.store)
            .field("max_rounds", &self.max_rounds)
            .finish()
    }
}

impl PersistenceManager {
    pub fn new(store: Store, approval: Arc<dyn ApprovalChannel>) -> Self {
        Self {
            store,
            approval,
            max_rounds: 5,
        }
    }

    pub fn with_max_rounds(mut self, rounds: usize) -> Self {
        self.max_rounds = rounds.max(1);
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Generation: each ranked candidate's scratch file must still exist.
    pub fn verify_generation(&self, run: &RunArtifacts, eval: &EvaluationResult) -> Result<()> {
        for ranked in &eval.ranking {
            let path = run
                .candidate(ranked.id)
                .and_then(|c| c.scratch_path.clone())
                .unwrap_or_else(|| run.scratch.join(format!("{}.md", ranked.id)));
            if !path.exists() {
                return Err(Error::ScratchMissing(path));
            }
        }
        Ok(())
    }

    fn request(
        &self,
        run: &RunArtifacts,
        eval: &EvaluationResult,
        round: usize,
    ) -> Option<ApprovalRequest> {
        let selected = eval.selected()?;
        let content = run.candidate(selected.id).map(|c| c.content.as_str()).unwrap_or("");
        Some(ApprovalRequest {
            task_id: run.task.id,
            key: run.task.key.clone(),
            kind: run.task.kind,
            round,
            selected: selected.id,
            worker: selected.worker_name.clone(),
            priority: selected.priority,
            total: selected.total,
            rationale: selected.rationale.clone(),
            preview: preview(content, PREVIEW_CHARS),
            alternatives: eval
                .eligible()
                .filter(|r| r.id != selected.id)
                .map(|r| Alternative {
                    slot: r.id.slot,
                    worker: r.worker_name.clone(),
                    total: r.total,
                })
                .collect(),
        })
    }

    /// Selection. With approval, waits for the approver; cancellation
    /// interrupts the wait.
    pub async fn select(
        &self,
        run: &RunArtifacts,
        eval: &mut EvaluationResult,
        approval_required: bool,
        cancel: &CancellationToken,
    ) -> Result<Selection> {
        let Some(selected) = eval.selected().map(|r| r.id) else {
            return Ok(Selection::Rejected("no candidate was selected".to_string()));
        };
        if !approval_required {
            return Ok(Selection::Approved(selected));
        }

        for round in 1..=self.max_rounds {
            let Some(request) = self.request(run, eval, round) else {
                break;
            };
            let decision = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Selection::Cancelled),
                decision = self.approval.decide(&request) => decision?,
            };
            info!(task = %run.task.id.short(), round, decision = ?decision, "approval decision");

            match decision {
                ApprovalDecision::Approve => return Ok(Selection::Approved(request.selected)),
                ApprovalDecision::PickAlternate(slot) => {
                    if eval.select_slot(slot) {
                        if let Some(picked) = eval.selected() {
                            return Ok(Selection::Approved(picked.id));
                        }
                    }
                    warn!(task = %run.task.id.short(), slot, "no eligible candidate in that slot");
                }
                ApprovalDecision::Regenerate => return Ok(Selection::Regenerate),
                ApprovalDecision::Reject => {
                    return Ok(Selection::Rejected("rejected by approver".to_string()))
                }
            }
        }
        Ok(Selection::Rejected(format!(
            "no decision after {} approval rounds",
            self.max_rounds
        )))
    }

    /// Placement of one candidate's scratch file.
    pub async fn place(&self, run: &RunArtifacts, selected: CandidateId) -> Result<PathBuf> {
        let candidate = run
            .candidate(selected)
            .ok_or_else(|| Error::PlacementFailure(format!("unknown candidate {selected}")))?;
        let scratch_file = candidate
            .scratch_path
            .clone()
            .ok_or_else(|| Error::ScratchMissing(run.scratch.join(format!("{selected}.md"))))?;
        let ranked = run.scores.get(&selected);
        let meta = PlacementMetadata {
            task_id: run.task.id,
            key: run.task.key.clone(),
            kind: run.task.kind,
            candidate: selected,
            worker: candidate.worker_name.clone(),
            priority: candidate.priority,
            score: ranked.map(|r| r.total).unwrap_or(0.0),
            rationale: ranked.map(|r| r.rationale.clone()).unwrap_or_default(),
            run: run.label.clone(),
            placed_at: Utc::now(),
        };
        let store = self.store.clone();
        blocking(move || store.place(&scratch_file, &meta)).await
    }

    /// Cleanup: archive all succeeded candidates except `placed`, then drop
    /// scratch. Returns the number of archive records.
    pub async fn cleanup(&self, run: &RunArtifacts, placed: Option<CandidateId>) -> Result<usize> {
        let records = run.archive_records(placed);
        let count = records.len();
        let index = ArchiveIndex {
            run: run.label.clone(),
            run_timestamp: run.started_at,
            kind: run.task.kind,
            key: run.task.key.clone(),
            task_id: run.task.id,
            record_count: count,
            records: records.iter().map(|r| r.candidate).collect(),
            placed,
            path: PathBuf::new(),
        };
        let store = self.store.clone();
        let label = run.label.clone();
        blocking(move || {
            if !records.is_empty() {
                store.archive_run(&index, &records)?;
            }
            store.remove_scratch(&label)
        })
        .await?;
        Ok(count)
    }

    /// Placement then cleanup. Also the retry path after a failure.
    pub async fn finish_placement(
        &self,
        run: &RunArtifacts,
        selected: CandidateId,
    ) -> Result<PersistenceOutcome> {
        match self.place(run, selected).await {
            Ok(artifact) => {
                let (archived, cleanup_error) = match self.cleanup(run, Some(selected)).await {
                    Ok(archived) => (archived, None),
                    Err(e) => {
                        warn!(
                            task = %run.task.id.short(),
                            candidate = %selected,
                            scratch = %run.scratch.display(),
                            error = %e,
                            "artifact placed but cleanup failed"
                        );
                        (0, Some(e.to_string()))
                    }
                };
                Ok(PersistenceOutcome::Placed {
                    artifact,
                    candidate: selected,
                    archived,
                    cleanup_error,
                })
            }
            Err(e) => {
                warn!(task = %run.task.id.short(), candidate = %selected, error = %e, "placement failed");
                Ok(PersistenceOutcome::PlacementFailed {
                    candidate: selected,
                    error: e.to_string(),
                })
            }
        }
    }

    /// All four stages in one call.
    ///
    /// `Orchestrator` drives the stages one at a time instead, recording a
    /// run state between them; this is the entry point for callers that
    /// only need the outcome.
    pub async fn persist(
        &self,
        run: &RunArtifacts,
        eval: &mut EvaluationResult,
        approval_required: bool,
        cancel: &CancellationToken,
    ) -> Result<PersistenceOutcome> {
        self.verify_generation(run, eval)?;
        match self.select(run, eval, approval_required, cancel).await? {
            Selection::Approved(id) => self.finish_placement(run, id).await,
            Selection::Regenerate => Ok(PersistenceOutcome::Regenerate),
            Selection::Rejected(reason) => {
                let archived = self.cleanup(run, None).await?;
                Ok(PersistenceOutcome::Aborted { reason, archived })
            }
            Selection::Cancelled => {
                let archived = self.cleanup(run, None).await?;
                Ok(PersistenceOutcome::Aborted {
                    reason: "cancelled".to_string(),
                    archived,
                })
            }
        }
    }
}
