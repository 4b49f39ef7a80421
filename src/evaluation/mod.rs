pub mod checks;
pub mod evaluator;
pub mod heuristics;
pub mod judge;
pub mod outline;
pub mod rubric;

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{Candidate, CandidateId, Task};
use crate::error::Result;

pub use checks::{CheckReport, CheckRunner};
pub use evaluator::{EvaluationResult, Evaluator, RankedCandidate, Verdict};
pub use heuristics::HeuristicScorer;
pub use judge::JudgeScorer;
pub use outline::{Outline, StructuralCheck};
pub use rubric::{Criterion, Rubric};

/// Everything a scorer needs besides the candidates.
#[derive(Debug, Clone, Copy)]
pub struct ScoringContext<'a> {
    pub task: &'a Task,
    pub rubric: &'a Rubric,
    /// Directory an external judge may use as its working directory.
    pub workspace: &'a Path,
}

/// Per-criterion scores for one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scorecard {
    pub candidate: CandidateId,
    pub criteria: BTreeMap<String, f64>,
    pub rationale: String,
}

/// Produces one scorecard per candidate, in the order given.
#[async_trait]
pub trait Scorer: Send + Sync {
    fn name(&self) -> &str;

    async fn score(
        &self,
        ctx: &ScoringContext<'_>,
        candidates: &[&Candidate],
    ) -> Result<Vec<Scorecard>>;
}
