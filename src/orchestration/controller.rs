//! Orchestration controller.
//!
//! `Orchestrator::run` drives one task through resolve, dispatch, evaluate,
//! optional approval and persistence. A batch with too few successes, or
//! whose evaluation has no winner, escalates to the next resolved worker.
//! The host-fallback sentinel is always the last resort: once the
//! escalation budget is spent the run jumps straight to it, so a run only
//! fails for want of workers after the host agent has had its turn.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::core::{Candidate, CandidateId, CandidateStatus, Task, TaskId, TaskKind};
use crate::error::{Error, Result};
use crate::evaluation::{Evaluator, HeuristicScorer, JudgeScorer, Rubric, Verdict};
use crate::orchestration::dispatcher::{Batch, DispatchTarget, Dispatcher};
use crate::orchestration::resolver::{
    role_for, Preferences, ResolvedEntry, ResolvedWorkers, Resolver, Target,
};
use crate::orchestration::state::{RunState, RunStateMachine};
use crate::orchestration::{AgentRegistry, CommandWorker, HealthTable};
use crate::persistence::{
    ApprovalChannel, PersistenceManager, PersistenceOutcome, RunArtifacts, Selection, Store,
};
use crate::util::blocking;
use crate::worker::Priority;

/// Progress notifications for front-ends.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    State {
        task: TaskId,
        from: RunState,
        to: RunState,
    },
    BatchFinished {
        task: TaskId,
        worker: String,
        batch: u32,
        succeeded: usize,
        fanout: usize,
    },
    Escalated {
        task: TaskId,
        from: String,
        to: String,
    },
    Selected {
        task: TaskId,
        candidate: CandidateId,
        worker: String,
        total: f64,
    },
}

/// Why one batch did not produce the placed artifact.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Selected { candidate: CandidateId },
    InsufficientSuccesses { succeeded: usize, required: usize },
    NoWinner { reason: String },
    Regenerated,
    Rejected { reason: String },
    Cancelled,
}

impl AttemptOutcome {
    /// The error a failed attempt amounts to, `None` for a selection.
    pub fn error(&self) -> Option<Error> {
        match self {
            AttemptOutcome::Selected { .. } => None,
            AttemptOutcome::InsufficientSuccesses { succeeded, required } => {
                Some(Error::InsufficientSuccesses {
                    succeeded: *succeeded,
                    required: *required,
                })
            }
            AttemptOutcome::NoWinner { reason } => Some(Error::NoWinner(reason.clone())),
            AttemptOutcome::Regenerated => Some(Error::Aborted("regenerated".to_string())),
            AttemptOutcome::Rejected { reason } => Some(Error::Aborted(reason.clone())),
            AttemptOutcome::Cancelled => Some(Error::Cancelled),
        }
    }
}

/// One batch sent to one worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    pub worker: String,
    pub priority: Priority,
    pub batch: u32,
    pub fanout: usize,
    pub succeeded: usize,
    /// `<candidate>: <reason>` for every slot that did not succeed.
    pub failures: Vec<String>,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    ExhaustedResolution,
    Rejected(String),
    RegenerationLimit,
    Cancelled,
}

/// Everything a caller needs to understand a failed run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureReport {
    pub task_id: TaskId,
    pub key: String,
    pub kind: TaskKind,
    pub reason: FailureReason,
    pub attempts: Vec<AttemptRecord>,
    /// Succeeded candidates kept in the archive for manual recovery.
    pub archived: usize,
    pub archive_dir: Option<PathBuf>,
    /// Set when archiving failed; the candidates stay in `scratch`.
    pub cleanup_error: Option<String>,
    pub scratch: PathBuf,
}

impl FailureReport {
    pub fn workers_tried(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for a in &self.attempts {
            if !names.contains(&a.worker.as_str()) {
                names.push(&a.worker);
            }
        }
        names
    }

    pub fn summary(&self) -> String {
        let mut text = format!(
            "{} task {} failed: {:?}\n",
            self.kind, self.key, self.reason
        );
        for a in &self.attempts {
            let result = match a.outcome.error() {
                Some(e) => e.to_string(),
                None => "selected".to_string(),
            };
            text.push_str(&format!(
                "  batch {} {} ({}): {}/{} succeeded, {result}\n",
                a.batch, a.worker, a.priority, a.succeeded, a.fanout
            ));
            for f in &a.failures {
                text.push_str(&format!("    {f}\n"));
            }
        }
        if let Some(dir) = &self.archive_dir {
            text.push_str(&format!(
                "  {} candidate(s) archived in {}\n",
                self.archived,
                dir.display()
            ));
        }
        if let Some(e) = &self.cleanup_error {
            text.push_str(&format!(
                "  archiving failed ({e}); candidates left in {}\n",
                self.scratch.display()
            ));
        }
        text
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlacedArtifact {
    pub task_id: TaskId,
    pub key: String,
    pub path: PathBuf,
    pub candidate: CandidateId,
    pub worker: String,
    pub score: f64,
    pub archived: usize,
    /// Archiving or scratch removal failed after placement.
    pub cleanup_error: Option<String>,
    pub attempts: Vec<AttemptRecord>,
    pub states: Vec<RunState>,
}

/// A run stopped at placement, ready for `Orchestrator::retry_placement`.
#[derive(Debug, Clone)]
pub struct PendingPlacement {
    pub run: RunArtifacts,
    pub candidate: CandidateId,
    machine: RunStateMachine,
    attempts: Vec<AttemptRecord>,
}

impl PendingPlacement {
    pub fn state(&self) -> RunState {
        self.machine.current()
    }
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Placed(PlacedArtifact),
    PlacementFailed {
        pending: Box<PendingPlacement>,
        error: String,
    },
    Failed(FailureReport),
}

impl RunOutcome {
    pub fn is_placed(&self) -> bool {
        matches!(self, RunOutcome::Placed(_))
    }

    pub fn into_result(self) -> Result<PlacedArtifact> {
        match self {
            RunOutcome::Placed(placed) => Ok(placed),
            RunOutcome::PlacementFailed { error, .. } => Err(Error::PlacementFailure(error)),
            RunOutcome::Failed(report) => Err(match &report.reason {
                FailureReason::ExhaustedResolution => Error::ExhaustedResolution(Box::new(report)),
                FailureReason::Cancelled => Error::Cancelled,
                FailureReason::Rejected(reason) => Error::Aborted(reason.clone()),
                FailureReason::RegenerationLimit => {
                    Error::Aborted("regeneration limit reached".to_string())
                }
            }),
        }
    }
}

/// Payload for a specialised worker. `feedback` carries what went wrong
/// with the previous batch of the run, if any.
pub fn worker_payload(task: &Task, rubric: &Rubric, feedback: Option<&str>) -> String {
    let mut text = format!("# {} task\n\n{}\n", task.kind, task.description);
    if let Some(lang) = task.capability {
        text.push_str(&format!("\nTarget language: {lang}\n"));
    }
    if let Some(outline) = &task.outline {
        text.push_str(&format!(
            "\nYour output must contain exactly these level-{} sections, in order:\n",
            outline.level
        ));
        for s in &outline.sections {
            text.push_str(&format!("- {s}\n"));
        }
    }
    text.push_str(&format!("\nYour output will be scored on:\n{}\n", rubric.describe()));
    if let Some(feedback) = feedback.filter(|f| !f.trim().is_empty()) {
        text.push_str(&format!(
            "\nA previous attempt at this task was not accepted. Address this feedback:\n{feedback}\n"
        ));
    }
    text
}

/// Payload for the host agent: the worker payload plus the role and
/// language guidance a specialist would have brought.
pub fn host_payload(task: &Task, rubric: &Rubric, feedback: Option<&str>) -> String {
    let role = role_for(task.kind);
    let mut text = format!(
        "No specialised {} is available for this task. Act as one.\n\n",
        role
    );
    if let Some(lang) = task.capability {
        text.push_str(&format!(
            "Follow {lang} idioms ({}) and avoid {}.\n\n",
            lang.idioms().join(", "),
            lang.anti_patterns().join(", ")
        ));
    }
    text.push_str(&worker_payload(task, rubric, feedback));
    text.push_str("\nReply with the complete artifact only, as markdown.\n");
    text
}

pub struct Orchestrator {
    config: Arc<Config>,
    registry: Arc<AgentRegistry>,
    health: Arc<HealthTable>,
    resolver: Resolver,
    evaluator: Evaluator,
    persistence: PersistenceManager,
    rubrics: HashMap<TaskKind, Rubric>,
    events: Option<mpsc::Sender<RunEvent>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("evaluator", &self.evaluator)
            .field("persistence", &self.persistence)
            .finish()
    }
}

impl Orchestrator {
    /// Build from a validated configuration and a populated registry.
    pub fn new(
        config: Config,
        registry: AgentRegistry,
        approval: Arc<dyn ApprovalChannel>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(registry);
        // One extra slot for the host worker.
        let health = Arc::new(HealthTable::new(registry.len() + 1, config.health.clone()));
        let resolver = Resolver::from_config(Arc::clone(&registry), Arc::clone(&health), &config);

        let mut rubrics = HashMap::new();
        for kind in TaskKind::ALL {
            let rubric = Rubric::for_kind(kind).with_overrides(&config.kind(kind).weights)?;
            rubrics.insert(kind, rubric);
        }

        let heuristic =
            HeuristicScorer::with_checks(config.kinds.implementation.checks.clone());
        let mut evaluator = Evaluator::new(Arc::new(heuristic.clone()));
        if let Some(judge) = &config.judge {
            let worker = CommandWorker::from_command_line("judge", &judge.command)?;
            let scorer = JudgeScorer::new(Arc::new(worker), judge.timeout()).with_fallback(heuristic);
            evaluator = evaluator.with_judge(Arc::new(scorer));
        }

        let store = Store::new(config.storage_root());
        let persistence = PersistenceManager::new(store, approval)
            .with_max_rounds(config.max_approval_rounds);

        Ok(Self {
            config: Arc::new(config),
            registry,
            health,
            resolver,
            evaluator,
            persistence,
            rubrics,
            events: None,
        })
    }

    /// Registry of `CommandWorker`s from the configuration's worker table.
    pub fn from_config(config: Config, approval: Arc<dyn ApprovalChannel>) -> Result<Self> {
        let registry = AgentRegistry::from_config(&config)?;
        Self::new(config, registry, approval)
    }

    pub fn with_evaluator(mut self, evaluator: Evaluator) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<RunEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthTable> {
        &self.health
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn store(&self) -> &Store {
        self.persistence.store()
    }

    fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            // Best effort; a slow consumer only loses progress updates.
            let _ = tx.try_send(event);
        }
    }

    fn transition(&self, machine: &mut RunStateMachine, task: TaskId, to: RunState) -> Result<()> {
        let from = machine.current();
        machine.transition(to)?;
        self.emit(RunEvent::State { task, from, to });
        Ok(())
    }

    fn target_for(&self, entry: &ResolvedEntry) -> Result<DispatchTarget> {
        match entry.target {
            Target::Worker(id) => {
                let handle = self
                    .registry
                    .handle(id)
                    .ok_or_else(|| Error::WorkerNotFound(id.to_string()))?;
                Ok(DispatchTarget {
                    id,
                    name: self.registry.name_of(id).to_string(),
                    priority: entry.priority,
                    handle,
                })
            }
            Target::HostFallback => {
                let handle = self.registry.host();
                Ok(DispatchTarget {
                    id: self.registry.host_id(),
                    name: handle.name().to_string(),
                    priority: Priority::Host,
                    handle,
                })
            }
        }
    }

    /// Run one task to a terminal outcome.
    ///
    /// # Errors
    ///
    /// Only infrastructure faults: the scratch directory cannot be created,
    /// or a scratch file vanished between dispatch and persistence.
    pub async fn run(&self, task: Task, cancel: CancellationToken) -> Result<RunOutcome> {
        let mut machine = RunStateMachine::new(task.id);
        let kind = self.config.kind(task.kind).clone();
        let rubric = self.rubrics.get(&task.kind).cloned().unwrap_or_else(|| Rubric::for_kind(task.kind));
        let store = self.persistence.store().clone();

        let mut run = RunArtifacts::new(task.clone(), Utc::now(), &store);
        let label = run.label.clone();
        blocking(move || store.create_scratch(&label).map(|_| ())).await?;
        let dispatcher = Dispatcher::new(Arc::clone(&self.health), run.scratch.clone());

        info!(
            task = %task.id.short(),
            key = %task.key,
            kind = %task.kind,
            capability = ?task.capability,
            run = %run.label,
            "run started"
        );

        let resolved = self.resolver.resolve(
            task.capability,
            task.kind,
            &Preferences {
                worker_override: task.worker_override.clone(),
            },
        );
        self.transition(&mut machine, task.id, RunState::Dispatching)?;

        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut position = 0usize;
        let mut batch_number = 0u32;
        let mut escalations = 0usize;
        let mut regenerations = 0usize;
        let mut feedback: Option<String> = None;

        loop {
            let Some(entry) = resolved.get(position).copied() else {
                return self.fail(machine, &run, attempts, FailureReason::ExhaustedResolution).await;
            };
            let target = self.target_for(&entry)?;
            let (payload, fanout) = match entry.target {
                Target::HostFallback => (host_payload(&task, &rubric, feedback.as_deref()), 1),
                Target::Worker(_) => (
                    worker_payload(&task, &rubric, feedback.as_deref()),
                    kind.fanout,
                ),
            };
            let batch = Batch {
                number: batch_number,
                fanout,
                timeout: kind.timeout(),
            };
            batch_number += 1;

            let candidates = dispatcher.dispatch(&payload, &target, batch, &cancel).await;
            run.add_batch(&candidates);
            let succeeded = candidates.iter().filter(|c| c.is_succeeded()).count();
            self.emit(RunEvent::BatchFinished {
                task: task.id,
                worker: target.name.clone(),
                batch: batch.number,
                succeeded,
                fanout,
            });
            let mut attempt = AttemptRecord {
                worker: target.name.clone(),
                priority: target.priority,
                batch: batch.number,
                fanout,
                succeeded,
                failures: failures(&candidates),
                outcome: AttemptOutcome::Cancelled,
            };

            if cancel.is_cancelled() {
                attempts.push(attempt);
                return self.fail(machine, &run, attempts, FailureReason::Cancelled).await;
            }

            let required = self.config.min_successes.min(fanout);
            if succeeded < required {
                feedback = Some(format!(
                    "Only {succeeded} of {fanout} attempts produced output:\n{}",
                    attempt.failures.join("\n")
                ));
                attempt.outcome = AttemptOutcome::InsufficientSuccesses { succeeded, required };
                attempts.push(attempt);
                warn!(
                    task = %task.id.short(),
                    worker = %target.name,
                    succeeded,
                    required,
                    "insufficient successes"
                );
                match self.escalate(&mut machine, &task, &resolved, position, &mut escalations)? {
                    Some(next) => {
                        position = next;
                        continue;
                    }
                    None => {
                        return self
                            .fail(machine, &run, attempts, FailureReason::ExhaustedResolution)
                            .await
                    }
                }
            }

            self.transition(&mut machine, task.id, RunState::Evaluating)?;
            let mut eval = self
                .evaluator
                .evaluate(&task, &candidates, &rubric, &run.scratch.join("judge"))
                .await;
            run.add_evaluation(&eval);

            let Some(winner) = eval.selected().cloned() else {
                let reason = match &eval.verdict {
                    Verdict::NoWinner { reason } => reason.clone(),
                    Verdict::Selected { .. } => String::new(),
                };
                attempt.outcome = AttemptOutcome::NoWinner { reason };
                attempts.push(attempt);
                feedback = Some(eval.feedback());
                match self.escalate(&mut machine, &task, &resolved, position, &mut escalations)? {
                    Some(next) => {
                        position = next;
                        continue;
                    }
                    None => {
                        return self
                            .fail(machine, &run, attempts, FailureReason::ExhaustedResolution)
                            .await
                    }
                }
            };
            self.emit(RunEvent::Selected {
                task: task.id,
                candidate: winner.id,
                worker: winner.worker_name.clone(),
                total: winner.total,
            });

            if cancel.is_cancelled() {
                attempts.push(attempt);
                return self.fail(machine, &run, attempts, FailureReason::Cancelled).await;
            }

            self.persistence.verify_generation(&run, &eval)?;
            if kind.approval_required {
                self.transition(&mut machine, task.id, RunState::AwaitingApproval)?;
            }
            let selection = self
                .persistence
                .select(&run, &mut eval, kind.approval_required, &cancel)
                .await?;

            match selection {
                Selection::Approved(id) => {
                    attempt.outcome = AttemptOutcome::Selected { candidate: id };
                    attempts.push(attempt);
                    self.transition(&mut machine, task.id, RunState::Persisting)?;
                    return self.place(machine, run, id, attempts).await;
                }
                Selection::Regenerate if regenerations < self.config.max_regenerations => {
                    regenerations += 1;
                    feedback = Some(format!(
                        "{}\nThe reviewer asked for a new attempt.",
                        eval.feedback()
                    ));
                    attempt.outcome = AttemptOutcome::Regenerated;
                    attempts.push(attempt);
                    info!(task = %task.id.short(), regenerations, "regenerating batch");
                    self.transition(&mut machine, task.id, RunState::Dispatching)?;
                }
                Selection::Regenerate => {
                    attempt.outcome = AttemptOutcome::Regenerated;
                    attempts.push(attempt);
                    return self
                        .fail(machine, &run, attempts, FailureReason::RegenerationLimit)
                        .await;
                }
                Selection::Rejected(reason) => {
                    attempt.outcome = AttemptOutcome::Rejected {
                        reason: reason.clone(),
                    };
                    attempts.push(attempt);
                    return self
                        .fail(machine, &run, attempts, FailureReason::Rejected(reason))
                        .await;
                }
                Selection::Cancelled => {
                    attempts.push(attempt);
                    return self.fail(machine, &run, attempts, FailureReason::Cancelled).await;
                }
            }
        }
    }

    /// Move to the next resolved worker, or to the host sentinel once the
    /// escalation budget is spent. `None` when nothing is left.
    fn escalate(
        &self,
        machine: &mut RunStateMachine,
        task: &Task,
        resolved: &ResolvedWorkers,
        position: usize,
        escalations: &mut usize,
    ) -> Result<Option<usize>> {
        self.transition(machine, task.id, RunState::Escalating)?;
        let last = resolved.len().saturating_sub(1);
        if position >= last {
            error!(task = %task.id.short(), tried = resolved.len(), "resolution exhausted");
            return Ok(None);
        }

        *escalations += 1;
        let next = if *escalations > self.config.max_escalations {
            last
        } else {
            position + 1
        };
        let name = |i: usize| {
            resolved
                .get(i)
                .map(|e| match e.target {
                    Target::Worker(id) => self.registry.name_of(id).to_string(),
                    Target::HostFallback => self.registry.host().name().to_string(),
                })
                .unwrap_or_default()
        };
        let (from, to) = (name(position), name(next));
        info!(task = %task.id.short(), from = %from, to = %to, escalations = *escalations, "escalating");
        self.emit(RunEvent::Escalated {
            task: task.id,
            from,
            to,
        });
        self.transition(machine, task.id, RunState::Dispatching)?;
        Ok(Some(next))
    }

    async fn place(
        &self,
        mut machine: RunStateMachine,
        run: RunArtifacts,
        candidate: CandidateId,
        attempts: Vec<AttemptRecord>,
    ) -> Result<RunOutcome> {
        match self.persistence.finish_placement(&run, candidate).await? {
            PersistenceOutcome::Placed {
                artifact,
                archived,
                cleanup_error,
                ..
            } => {
                self.transition(&mut machine, run.task.id, RunState::Done)?;
                let ranked = run.scores.get(&candidate);
                info!(
                    task = %run.task.id.short(),
                    key = %run.task.key,
                    candidate = %candidate,
                    archived,
                    "run done"
                );
                Ok(RunOutcome::Placed(PlacedArtifact {
                    task_id: run.task.id,
                    key: run.task.key.clone(),
                    path: artifact,
                    candidate,
                    worker: run
                        .candidate(candidate)
                        .map(|c| c.worker_name.clone())
                        .unwrap_or_default(),
                    score: ranked.map(|r| r.total).unwrap_or(0.0),
                    archived,
                    cleanup_error,
                    attempts,
                    states: machine.path(),
                }))
            }
            PersistenceOutcome::PlacementFailed { error, .. } => Ok(RunOutcome::PlacementFailed {
                pending: Box::new(PendingPlacement {
                    run,
                    candidate,
                    machine,
                    attempts,
                }),
                error,
            }),
            other => Err(Error::PlacementFailure(format!(
                "unexpected persistence outcome {other:?}"
            ))),
        }
    }

    /// Retry placement alone after a placement failure.
    pub async fn retry_placement(&self, pending: PendingPlacement) -> Result<RunOutcome> {
        let PendingPlacement {
            run,
            candidate,
            machine,
            attempts,
        } = pending;
        info!(task = %run.task.id.short(), candidate = %candidate, "retrying placement");
        self.place(machine, run, candidate, attempts).await
    }

    async fn fail(
        &self,
        mut machine: RunStateMachine,
        run: &RunArtifacts,
        attempts: Vec<AttemptRecord>,
        reason: FailureReason,
    ) -> Result<RunOutcome> {
        let (archived, cleanup_error) = match self.persistence.cleanup(run, None).await {
            Ok(archived) => (archived, None),
            Err(e) => {
                error!(task = %run.task.id.short(), error = %e, "archiving failed run");
                (0, Some(e.to_string()))
            }
        };
        if machine.can_transition(RunState::Failed) {
            self.transition(&mut machine, run.task.id, RunState::Failed)?;
        }
        let archive_dir = (archived > 0)
            .then(|| self.store().run_archive_dir(run.task.kind, &run.label));
        let report = FailureReport {
            task_id: run.task.id,
            key: run.task.key.clone(),
            kind: run.task.kind,
            reason,
            attempts,
            archived,
            archive_dir,
            cleanup_error,
            scratch: run.scratch.clone(),
        };
        error!(
            task = %run.task.id.short(),
            reason = ?report.reason,
            workers = ?report.workers_tried(),
            archived,
            "run failed"
        );
        Ok(RunOutcome::Failed(report))
    }
}

fn failures(candidates: &[Candidate]) -> Vec<String> {
    candidates
        .iter()
        .filter_map(|c| match &c.status {
            CandidateStatus::Failed { reason } => Some(format!("{}: {reason}", c.id)),
            CandidateStatus::TimedOut => Some(format!("{}: timed out", c.id)),
            CandidateStatus::Pending => Some(format!("{}: never finished", c.id)),
            CandidateStatus::Succeeded => None,
        })
        .collect()
}
