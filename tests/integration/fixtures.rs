//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Scripted mock workers (reply, fail, hang) keyed by dispatch slot
//! - A marker scorer that reads the score out of the candidate text
//! - A harness building an `Orchestrator` over a temporary storage root

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use gauntlet::config::{Config, LanguageConfig};
use gauntlet::core::{Candidate, Language, Task, TaskKind, TaskSubmission};
use gauntlet::evaluation::{Evaluator, Scorecard, Scorer, ScoringContext};
use gauntlet::orchestration::AgentRegistry;
use gauntlet::persistence::{ApprovalChannel, AutoApprove, Store};
use gauntlet::worker::{InvocationRequest, Worker, WorkerRole};
use gauntlet::{Error, Orchestrator, Result, RunOutcome};

/// What one slot does when invoked.
#[derive(Debug, Clone, PartialEq)]
pub enum Behavior {
    Reply(String),
    Fail,
    /// Sleeps far past any test timeout.
    Hang,
}

/// A worker whose behaviour is scripted per slot.
///
/// The slot comes from the invocation workspace name (`b<batch>-s<slot>.work`),
/// so the script holds regardless of the order slots start in.
pub struct MockWorker {
    name: String,
    default: Behavior,
    slots: HashMap<u32, Behavior>,
    calls: AtomicUsize,
    seen: Mutex<Vec<InvocationRequest>>,
}

impl MockWorker {
    pub fn new(name: &str, default: Behavior) -> Self {
        Self {
            name: name.to_string(),
            default,
            slots: HashMap::new(),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(name: &str, text: &str) -> Self {
        Self::new(name, Behavior::Reply(text.to_string()))
    }

    pub fn failing(name: &str) -> Self {
        Self::new(name, Behavior::Fail)
    }

    pub fn slot(mut self, slot: u32, behavior: Behavior) -> Self {
        self.slots.insert(slot, behavior);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn payloads(&self) -> Vec<String> {
        self.seen.lock().iter().map(|r| r.payload.clone()).collect()
    }
}

/// Slot index from a workspace path such as `.../b1-s3.work`.
fn slot_of(workspace: &Path) -> Option<u32> {
    let name = workspace.file_name()?.to_str()?;
    let stem = name.strip_suffix(".work")?;
    stem.rsplit_once("-s")?.1.parse().ok()
}

#[async_trait]
impl Worker for MockWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &InvocationRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(request.clone());

        let behavior = slot_of(&request.workspace)
            .and_then(|slot| self.slots.get(&slot))
            .unwrap_or(&self.default)
            .clone();
        match behavior {
            Behavior::Reply(text) => Ok(text),
            Behavior::Fail => Err(Error::InvocationFailure(format!("{} crashed", self.name))),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok("too late".to_string())
            }
        }
    }
}

/// Scores every rubric criterion with the value of a `score: <x>` line in
/// the candidate, 0.5 when there is none. The weighted total then equals `x`.
#[derive(Debug, Default)]
pub struct MarkerScorer {
    pub rounds: AtomicUsize,
}

pub fn marker(text: &str) -> f64 {
    text.lines()
        .find_map(|l| l.trim().strip_prefix("score:"))
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0.5)
}

#[async_trait]
impl Scorer for MarkerScorer {
    fn name(&self) -> &str {
        "marker"
    }

    async fn score(
        &self,
        ctx: &ScoringContext<'_>,
        candidates: &[&Candidate],
    ) -> Result<Vec<Scorecard>> {
        self.rounds.fetch_add(1, Ordering::SeqCst);
        Ok(candidates
            .iter()
            .map(|c| {
                let value = marker(&c.content);
                Scorecard {
                    candidate: c.id,
                    criteria: ctx.rubric.names().map(|n| (n.to_string(), value)).collect(),
                    rationale: format!("marker {value:.2}"),
                }
            })
            .collect())
    }
}

/// A design document with a score marker and the given level-2 sections.
pub fn design_doc(title: &str, score: f64, sections: &[&str]) -> String {
    let mut text = format!("# {title}\n\nscore: {score}\n");
    for s in sections {
        text.push_str(&format!("\n## {s}\n\nDetails about {s}.\n"));
    }
    text
}

/// Config with no configured workers, a one-second timeout and no approval.
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.storage_root = root.display().to_string();
    config.workers.clear();
    config.languages.clear();
    for kind in [
        &mut config.kinds.design,
        &mut config.kinds.elaboration,
        &mut config.kinds.implementation,
    ] {
        kind.timeout_secs = 1;
        kind.approval_required = false;
    }
    config
}

pub fn go_fallback(config: &mut Config, architect: &str) {
    config.languages.insert(
        "go".to_string(),
        LanguageConfig {
            fallback_architect: Some(architect.to_string()),
            fallback_developer: None,
        },
    );
}

pub fn task(kind: TaskKind, capability: Option<Language>) -> Task {
    Task::from_submission(TaskSubmission::new("a pomodoro timer", kind), capability)
        .expect("valid submission")
}

/// Temporary storage plus the pieces needed to build an orchestrator.
pub struct Harness {
    pub dir: TempDir,
    pub config: Config,
    pub registry: AgentRegistry,
    pub scorer: Arc<MarkerScorer>,
}

impl Harness {
    /// A harness whose host agent behaves like `host`.
    pub fn new(host: Arc<MockWorker>) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let config = test_config(dir.path());
        Self {
            dir,
            config,
            registry: AgentRegistry::new(host),
            scorer: Arc::new(MarkerScorer::default()),
        }
    }

    pub fn register(
        &mut self,
        role: WorkerRole,
        language: Option<Language>,
        worker: Arc<MockWorker>,
    ) -> &mut Self {
        self.registry
            .register(role, language, worker)
            .expect("unique worker name");
        self
    }

    pub fn store(&self) -> Store {
        Store::new(self.dir.path())
    }

    /// Orchestrator scored by the marker scorer.
    pub fn build(self, approval: Arc<dyn ApprovalChannel>) -> (Orchestrator, TempDir, Arc<MarkerScorer>) {
        let Harness {
            dir,
            config,
            registry,
            scorer,
        } = self;
        let evaluator = Evaluator::new(Arc::clone(&scorer) as Arc<dyn Scorer>);
        let orchestrator = Orchestrator::new(config, registry, approval)
            .expect("valid config")
            .with_evaluator(evaluator);
        (orchestrator, dir, scorer)
    }

    pub fn build_auto(self) -> (Orchestrator, TempDir, Arc<MarkerScorer>) {
        self.build(Arc::new(AutoApprove))
    }
}

pub async fn run(orchestrator: &Orchestrator, task: Task) -> RunOutcome {
    orchestrator
        .run(task, CancellationToken::new())
        .await
        .expect("run infrastructure")
}
