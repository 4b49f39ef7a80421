//! Scoring by an external judge worker.
//!
//! The judge sees the rubric and every candidate in one prompt so it can
//! compare them, and must answer with JSON:
//!
//! ```json
//! {"scores": [{"slot": 0, "criteria": {"idioms": 0.8}, "rationale": "..."}]}
//! ```
//!
//! Any failure (invocation error, timeout, unparsable or incomplete reply)
//! falls back to the deterministic scorer for the whole evaluation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::core::Candidate;
use crate::error::{Error, Result};
use crate::evaluation::heuristics::HeuristicScorer;
use crate::evaluation::{Scorecard, Scorer, ScoringContext};
use crate::worker::{InvocationRequest, Worker};

#[derive(Debug, Deserialize)]
struct JudgeReply {
    scores: Vec<JudgeEntry>,
}

#[derive(Debug, Deserialize)]
struct JudgeEntry {
    slot: u32,
    #[serde(default)]
    criteria: BTreeMap<String, f64>,
    #[serde(default)]
    rationale: String,
}

pub struct JudgeScorer {
    worker: Arc<dyn Worker>,
    timeout: Duration,
    fallback: HeuristicScorer,
}

impl std::fmt::Debug for JudgeScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JudgeScorer")
            .field("worker", &self.worker.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl JudgeScorer {
    pub fn new(worker: Arc<dyn Worker>, timeout: Duration) -> Self {
        Self {
            worker,
            timeout,
            fallback: HeuristicScorer::new(),
        }
    }

    pub fn with_fallback(mut self, fallback: HeuristicScorer) -> Self {
        self.fallback = fallback;
        self
    }

    async fn judge(
        &self,
        ctx: &ScoringContext<'_>,
        candidates: &[&Candidate],
    ) -> Result<Vec<Scorecard>> {
        let request = InvocationRequest {
            payload: build_prompt(ctx, candidates),
            timeout: self.timeout,
            workspace: ctx.workspace.to_path_buf(),
        };
        let reply = tokio::time::timeout(self.timeout, self.worker.invoke(&request))
            .await
            .map_err(|_| Error::InvocationTimeout(self.timeout))??;
        debug!(judge = %self.worker.name(), bytes = reply.len(), "judge replied");
        parse_reply(&reply, candidates)
    }
}

pub fn build_prompt(ctx: &ScoringContext<'_>, candidates: &[&Candidate]) -> String {
    let mut prompt = format!(
        "You are judging {} competing {} candidates for this task:\n\n{}\n\n\
         Score every candidate on each criterion from 0.0 to 1.0.\n\n\
         Rubric:\n{}\n\n",
        candidates.len(),
        ctx.task.kind,
        ctx.task.description,
        ctx.rubric.describe(),
    );
    if let Some(outline) = &ctx.task.outline {
        prompt.push_str(&format!(
            "Required sections (level {}): {}\n\n",
            outline.level,
            outline.sections.join(", ")
        ));
    }
    for c in candidates {
        prompt.push_str(&format!(
            "=== CANDIDATE slot {} ===\n{}\n=== END slot {} ===\n\n",
            c.slot(),
            c.content,
            c.slot()
        ));
    }
    prompt.push_str(
        "Reply with JSON only:\n\
         {\"scores\": [{\"slot\": <n>, \"criteria\": {\"<criterion>\": <score>}, \"rationale\": \"<why>\"}]}\n",
    );
    prompt
}

/// The JSON object inside `text`, with or without a code fence around it.
fn json_body(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| &text[start..=end])
}

pub fn parse_reply(text: &str, candidates: &[&Candidate]) -> Result<Vec<Scorecard>> {
    let body = json_body(text)
        .ok_or_else(|| Error::InvocationFailure("judge reply has no JSON object".to_string()))?;
    let reply: JudgeReply = serde_json::from_str(body)?;
    let mut by_slot: BTreeMap<u32, JudgeEntry> =
        reply.scores.into_iter().map(|e| (e.slot, e)).collect();

    candidates
        .iter()
        .map(|c| {
            let entry = by_slot.remove(&c.slot()).ok_or_else(|| {
                Error::InvocationFailure(format!("judge omitted slot {}", c.slot()))
            })?;
            let criteria = entry
                .criteria
                .into_iter()
                .map(|(k, v)| (k, v.clamp(0.0, 1.0)))
                .collect();
            Ok(Scorecard {
                candidate: c.id,
                criteria,
                rationale: entry.rationale,
            })
        })
        .collect()
}

#[async_trait]
impl Scorer for JudgeScorer {
    fn name(&self) -> &str {
        "judge"
    }

    async fn score(
        &self,
        ctx: &ScoringContext<'_>,
        candidates: &[&Candidate],
    ) -> Result<Vec<Scorecard>> {
        match self.judge(ctx, candidates).await {
            Ok(cards) => {
                info!(judge = %self.worker.name(), candidates = cards.len(), "judge scored candidates");
                Ok(cards)
            }
            Err(e) => {
                warn!(judge = %self.worker.name(), error = %e, "judge failed, using heuristic scores");
                self.fallback.score(ctx, candidates).await
            }
        }
    }
}
