//! The Evaluator: structural gate, scoring, ranking.
//!
//! Only succeeded candidates are considered. Candidates that fail the
//! task's required outline are scored like the rest, so they can be
//! archived with a score, but can never be selected. Ranking is by weighted
//! total, then worker priority, then candidate id.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::{Candidate, CandidateId, Task, TaskKind};
use crate::evaluation::heuristics::HeuristicScorer;
use crate::evaluation::{Rubric, Scorecard, Scorer, ScoringContext, StructuralCheck};
use crate::worker::{Priority, WorkerId};

const SINGLE_SURVIVOR: &str = "only successful candidate; scoring skipped";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub id: CandidateId,
    pub worker: WorkerId,
    pub worker_name: String,
    pub priority: Priority,
    pub total: f64,
    pub criteria: BTreeMap<String, f64>,
    pub rationale: String,
    /// Gate result; `None` when the task has no required outline.
    pub structural: Option<StructuralCheck>,
}

impl RankedCandidate {
    pub fn disqualified(&self) -> bool {
        self.structural.as_ref().is_some_and(|c| !c.passed())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Selected { id: CandidateId },
    NoWinner { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    /// Succeeded candidates, best first.
    pub ranking: Vec<RankedCandidate>,
    pub verdict: Verdict,
    /// Which scorer produced the scores.
    pub scorer: String,
}

impl EvaluationResult {
    fn no_winner(ranking: Vec<RankedCandidate>, scorer: &str, reason: String) -> Self {
        Self {
            ranking,
            verdict: Verdict::NoWinner { reason },
            scorer: scorer.to_string(),
        }
    }

    pub fn selected(&self) -> Option<&RankedCandidate> {
        match &self.verdict {
            Verdict::Selected { id } => self.get(*id),
            Verdict::NoWinner { .. } => None,
        }
    }

    pub fn is_no_winner(&self) -> bool {
        matches!(self.verdict, Verdict::NoWinner { .. })
    }

    pub fn get(&self, id: CandidateId) -> Option<&RankedCandidate> {
        self.ranking.iter().find(|r| r.id == id)
    }

    /// Candidates that could be selected, best first.
    pub fn eligible(&self) -> impl Iterator<Item = &RankedCandidate> {
        self.ranking.iter().filter(|r| !r.disqualified())
    }

    /// Override the selection with an eligible candidate by slot.
    ///
    /// Returns false, leaving the result unchanged, when no eligible
    /// candidate has that slot.
    pub fn select_slot(&mut self, slot: u32) -> bool {
        let Some(id) = self.eligible().find(|r| r.id.slot == slot).map(|r| r.id) else {
            return false;
        };
        self.verdict = Verdict::Selected { id };
        true
    }

    /// Notes for the batch that follows this one: why nothing was accepted,
    /// which candidates broke the outline, and the best review so far.
    pub fn feedback(&self) -> String {
        let mut lines = Vec::new();
        if let Verdict::NoWinner { reason } = &self.verdict {
            lines.push(format!("No candidate was accepted: {reason}"));
        }
        for r in self.ranking.iter().filter(|r| r.disqualified()) {
            if let Some(check) = &r.structural {
                lines.push(format!("Candidate {} had the wrong structure ({})", r.id, check.summary()));
            }
        }
        if let Some(best) = self.selected().or_else(|| self.ranking.first()) {
            lines.push(format!("Best review so far ({:.2}): {}", best.total, best.rationale));
        }
        lines.join("\n")
    }
}

/// Highest total first, then higher priority, then lower id.
pub fn rank_order(a: &RankedCandidate, b: &RankedCandidate) -> Ordering {
    b.total
        .total_cmp(&a.total)
        .then(a.priority.cmp(&b.priority))
        .then(a.id.cmp(&b.id))
}

pub struct Evaluator {
    heuristic: Arc<dyn Scorer>,
    judge: Option<Arc<dyn Scorer>>,
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator")
            .field("heuristic", &self.heuristic.name())
            .field("judge", &self.judge.as_ref().map(|j| j.name().to_string()))
            .finish()
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new(Arc::new(HeuristicScorer::new()))
    }
}

impl Evaluator {
    pub fn new(heuristic: Arc<dyn Scorer>) -> Self {
        Self {
            heuristic,
            judge: None,
        }
    }

    /// Judge design and elaboration candidates with `judge`.
    pub fn with_judge(mut self, judge: Arc<dyn Scorer>) -> Self {
        self.judge = Some(judge);
        self
    }

    fn scorer_for(&self, kind: TaskKind) -> &Arc<dyn Scorer> {
        match (kind, &self.judge) {
            (TaskKind::Design | TaskKind::Elaboration, Some(judge)) => judge,
            _ => &self.heuristic,
        }
    }

    pub async fn evaluate(
        &self,
        task: &Task,
        candidates: &[Candidate],
        rubric: &Rubric,
        workspace: &Path,
    ) -> EvaluationResult {
        let succeeded: Vec<&Candidate> = candidates.iter().filter(|c| c.is_succeeded()).collect();
        let scorer = self.scorer_for(task.kind);

        if succeeded.is_empty() {
            return EvaluationResult::no_winner(
                Vec::new(),
                scorer.name(),
                format!("none of {} candidates succeeded", candidates.len()),
            );
        }

        let gate: HashMap<CandidateId, StructuralCheck> = match &task.outline {
            Some(outline) => succeeded
                .iter()
                .map(|c| (c.id, outline.check(&c.content)))
                .collect(),
            None => HashMap::new(),
        };

        let (cards, scorer_name) = if succeeded.len() == 1 {
            let only = succeeded[0];
            let card = Scorecard {
                candidate: only.id,
                criteria: BTreeMap::new(),
                rationale: SINGLE_SURVIVOR.to_string(),
            };
            (vec![card], "single_survivor".to_string())
        } else {
            let ctx = ScoringContext {
                task,
                rubric,
                workspace,
            };
            self.score_all(scorer, &ctx, &succeeded).await
        };

        let by_id: HashMap<CandidateId, Scorecard> =
            cards.into_iter().map(|card| (card.candidate, card)).collect();

        let mut ranking: Vec<RankedCandidate> = succeeded
            .iter()
            .map(|c| {
                let card = by_id.get(&c.id);
                let criteria = card.map(|s| s.criteria.clone()).unwrap_or_default();
                let total = if succeeded.len() == 1 {
                    1.0
                } else {
                    rubric.weighted_total(&criteria)
                };
                RankedCandidate {
                    id: c.id,
                    worker: c.worker,
                    worker_name: c.worker_name.clone(),
                    priority: c.priority,
                    total,
                    criteria,
                    rationale: card.map(|s| s.rationale.clone()).unwrap_or_default(),
                    structural: gate.get(&c.id).cloned(),
                }
            })
            .collect();
        ranking.sort_by(rank_order);

        for r in &ranking {
            debug!(
                task = %task.id.short(),
                candidate = %r.id,
                worker = %r.worker_name,
                total = r.total,
                disqualified = r.disqualified(),
                "ranked candidate"
            );
        }

        let winner = ranking.iter().find(|r| !r.disqualified()).map(|r| r.id);
        let result = match winner {
            Some(id) => EvaluationResult {
                ranking,
                verdict: Verdict::Selected { id },
                scorer: scorer_name,
            },
            None => {
                let reason = format!(
                    "all {} candidates failed the structural gate ({})",
                    ranking.len(),
                    ranking[0]
                        .structural
                        .as_ref()
                        .map(|c| c.summary())
                        .unwrap_or_default()
                );
                EvaluationResult::no_winner(ranking, &scorer_name, reason)
            }
        };

        match &result.verdict {
            Verdict::Selected { id } => info!(
                task = %task.id.short(),
                winner = %id,
                scorer = %result.scorer,
                candidates = result.ranking.len(),
                "evaluation selected a winner"
            ),
            Verdict::NoWinner { reason } => {
                info!(task = %task.id.short(), reason = %reason, "evaluation found no winner")
            }
        }
        result
    }

    async fn score_all(
        &self,
        scorer: &Arc<dyn Scorer>,
        ctx: &ScoringContext<'_>,
        candidates: &[&Candidate],
    ) -> (Vec<Scorecard>, String) {
        match scorer.score(ctx, candidates).await {
            Ok(cards) if cards.len() == candidates.len() => {
                return (cards, scorer.name().to_string())
            }
            Ok(cards) => warn!(
                scorer = %scorer.name(),
                expected = candidates.len(),
                got = cards.len(),
                "scorer returned the wrong number of scorecards"
            ),
            Err(e) => warn!(scorer = %scorer.name(), error = %e, "scorer failed"),
        }
        match self.heuristic.score(ctx, candidates).await {
            Ok(cards) => (cards, self.heuristic.name().to_string()),
            Err(e) => {
                warn!(error = %e, "heuristic scorer failed, scoring zero");
                let cards = candidates
                    .iter()
                    .map(|c| Scorecard {
                        candidate: c.id,
                        criteria: BTreeMap::new(),
                        rationale: format!("scoring failed: {e}"),
                    })
                    .collect();
                (cards, "none".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CandidateStatus, TaskSubmission};
    use crate::error::{Error, Result};
    use crate::evaluation::tests::candidate;
    use crate::evaluation::Outline;
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Scores every candidate from a fixed map keyed by slot.
    struct Fixed(HashMap<u32, f64>);

    #[async_trait]
    impl Scorer for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn score(
            &self,
            ctx: &ScoringContext<'_>,
            candidates: &[&Candidate],
        ) -> Result<Vec<Scorecard>> {
            Ok(candidates
                .iter()
                .map(|c| {
                    let v = self.0.get(&c.slot()).copied().unwrap_or(0.0);
                    Scorecard {
                        candidate: c.id,
                        criteria: ctx.rubric.names().map(|n| (n.to_string(), v)).collect(),
                        rationale: format!("fixed {v}"),
                    }
                })
                .collect())
        }
    }

    struct Broken;

    #[async_trait]
    impl Scorer for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn score(&self, _: &ScoringContext<'_>, _: &[&Candidate]) -> Result<Vec<Scorecard>> {
            Err(Error::InvocationFailure("judge down".into()))
        }
    }

    fn fixed(scores: &[(u32, f64)]) -> Evaluator {
        Evaluator::new(Arc::new(Fixed(scores.iter().copied().collect())))
    }

    fn task(kind: TaskKind) -> Task {
        Task::from_submission(TaskSubmission::new("build a thing", kind), None).unwrap()
    }

    async fn run(ev: &Evaluator, task: &Task, candidates: &[Candidate]) -> EvaluationResult {
        let dir = TempDir::new().unwrap();
        ev.evaluate(task, candidates, &Rubric::for_kind(task.kind), dir.path())
            .await
    }

    #[tokio::test]
    async fn test_highest_score_wins() {
        let cs = vec![candidate(0, "a"), candidate(1, "b"), candidate(2, "c")];
        let result = run(&fixed(&[(0, 0.2), (1, 0.9), (2, 0.5)]), &task(TaskKind::Design), &cs).await;
        assert_eq!(result.selected().unwrap().id.slot, 1);
        let order: Vec<u32> = result.ranking.iter().map(|r| r.id.slot).collect();
        assert_eq!(order, [1, 2, 0]);
        assert_eq!(result.scorer, "fixed");
    }

    #[tokio::test]
    async fn test_only_succeeded_are_ranked() {
        let mut failed = candidate(1, "");
        failed.status = CandidateStatus::TimedOut;
        let cs = vec![candidate(0, "a"), failed, candidate(2, "c")];
        let result = run(&fixed(&[(0, 0.5), (2, 0.6)]), &task(TaskKind::Design), &cs).await;
        assert_eq!(result.ranking.len(), 2);
        assert!(result.get(CandidateId::new(0, 1)).is_none());
    }

    #[tokio::test]
    async fn test_tie_prefers_priority_then_lower_slot() {
        let mut generic = candidate(0, "a");
        generic.priority = Priority::Generic;
        let cs = vec![generic, candidate(1, "b"), candidate(2, "c")];
        let ev = fixed(&[(0, 0.7), (1, 0.7), (2, 0.7)]);
        for _ in 0..5 {
            let result = run(&ev, &task(TaskKind::Design), &cs).await;
            assert_eq!(result.selected().unwrap().id.slot, 1);
            assert_eq!(result.ranking.last().unwrap().id.slot, 0);
        }
    }

    #[tokio::test]
    async fn test_single_survivor_skips_scoring() {
        let mut failed = candidate(1, "");
        failed.status = CandidateStatus::Failed {
            reason: "boom".into(),
        };
        let cs = vec![candidate(0, "only"), failed];
        let result = run(&Evaluator::new(Arc::new(Broken)), &task(TaskKind::Design), &cs).await;
        let winner = result.selected().unwrap();
        assert_eq!(winner.total, 1.0);
        assert_eq!(winner.rationale, SINGLE_SURVIVOR);
        assert_eq!(result.scorer, "single_survivor");
    }

    #[tokio::test]
    async fn test_structural_gate_disqualifies() {
        let mut t = task(TaskKind::Elaboration);
        t.outline = Some(Outline::new(2, &["Overview", "Design", "Testing"]));
        let good = "## Overview\n## Design\n## Testing\n";
        let short = "## Overview\n## Design\n";
        let cs = vec![candidate(0, short), candidate(1, good), candidate(2, short)];
        // The short ones score higher but cannot win.
        let result = run(&fixed(&[(0, 0.9), (1, 0.3), (2, 0.9)]), &t, &cs).await;
        assert_eq!(result.selected().unwrap().id.slot, 1);
        assert_eq!(result.ranking[0].id.slot, 0);
        assert!(result.ranking[0].disqualified());
        assert_eq!(result.eligible().count(), 1);
    }

    #[tokio::test]
    async fn test_no_winner_when_all_disqualified() {
        let mut t = task(TaskKind::Elaboration);
        t.outline = Some(Outline::new(2, &["Overview", "Design", "Testing"]));
        let cs = vec![candidate(0, "## Overview\n"), candidate(1, "## Design\n")];
        let result = run(&fixed(&[(0, 0.5), (1, 0.5)]), &t, &cs).await;
        assert!(result.is_no_winner());
        assert_eq!(result.ranking.len(), 2);
        match &result.verdict {
            Verdict::NoWinner { reason } => assert!(reason.contains("structural gate")),
            other => panic!("unexpected verdict {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_feedback_names_structure_problems() {
        let mut t = task(TaskKind::Elaboration);
        t.outline = Some(Outline::new(2, &["Overview", "Design", "Testing"]));
        let cs = vec![candidate(0, "## Overview\n## Design\n"), candidate(1, "## Design\n")];
        let result = run(&fixed(&[(0, 0.8), (1, 0.4)]), &t, &cs).await;

        let feedback = result.feedback();
        assert!(feedback.starts_with("No candidate was accepted"));
        assert!(feedback.contains("Candidate b0-s0 had the wrong structure (missing: testing)"));
        assert!(feedback.contains("Candidate b0-s1"));
        assert!(feedback.ends_with("fixed 0.8"));
    }

    #[tokio::test]
    async fn test_no_winner_when_nothing_succeeded() {
        let mut a = candidate(0, "");
        a.status = CandidateStatus::TimedOut;
        let result = run(&Evaluator::default(), &task(TaskKind::Design), &[a]).await;
        assert!(result.is_no_winner());
        assert!(result.ranking.is_empty());
    }

    #[tokio::test]
    async fn test_judge_used_for_design_only() {
        let ev = Evaluator::new(Arc::new(Fixed(HashMap::new())))
            .with_judge(Arc::new(Fixed([(0, 1.0)].into_iter().collect())));
        let cs = vec![candidate(0, "a"), candidate(1, "b")];
        let design = run(&ev, &task(TaskKind::Design), &cs).await;
        assert_eq!(design.selected().unwrap().id.slot, 0);
        assert!((design.ranking[0].total - 1.0).abs() < 1e-9);

        let implementation = run(&ev, &task(TaskKind::Implementation), &cs).await;
        assert_eq!(implementation.ranking[0].total, 0.0);
    }

    #[tokio::test]
    async fn test_broken_scorer_falls_back() {
        let ev = Evaluator::default().with_judge(Arc::new(Broken));
        let cs = vec![candidate(0, "## Overview\ntext"), candidate(1, "plain")];
        let result = run(&ev, &task(TaskKind::Design), &cs).await;
        assert_eq!(result.scorer, "heuristic");
        assert!(result.selected().is_some());
    }

    #[tokio::test]
    async fn test_select_slot() {
        let cs = vec![candidate(0, "a"), candidate(1, "b"), candidate(2, "c")];
        let mut result = run(&fixed(&[(0, 0.9)]), &task(TaskKind::Design), &cs).await;
        assert!(result.select_slot(2));
        assert_eq!(result.selected().unwrap().id.slot, 2);
        assert!(!result.select_slot(7));
        assert_eq!(result.selected().unwrap().id.slot, 2);
    }
}
