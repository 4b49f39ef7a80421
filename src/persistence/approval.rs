//! External approval of a selected candidate.

use std::collections::VecDeque;
use std::io::Write as _;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::core::{CandidateId, TaskId, TaskKind};
use crate::error::Result;
use crate::worker::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "slot", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    /// Use the eligible candidate in this slot of the same batch instead.
    PickAlternate(u32),
    Regenerate,
    Reject,
}

impl std::str::FromStr for ApprovalDecision {
    type Err = String;

    /// `y`, `a <slot>`, `r` or `n`, plus the spelled-out forms.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let head = words.next().unwrap_or("").to_lowercase();
        match head.as_str() {
            "y" | "yes" | "approve" => Ok(ApprovalDecision::Approve),
            "r" | "regenerate" => Ok(ApprovalDecision::Regenerate),
            "n" | "no" | "reject" => Ok(ApprovalDecision::Reject),
            "a" | "alt" | "pick" | "pick-alternate" => words
                .next()
                .and_then(|w| w.parse().ok())
                .map(ApprovalDecision::PickAlternate)
                .ok_or_else(|| format!("expected a slot number after {head:?}")),
            _ => Err(format!("unrecognised decision: {s:?}")),
        }
    }
}

/// One alternative the approver may pick instead.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alternative {
    pub slot: u32,
    pub worker: String,
    pub total: f64,
}

/// What the approver is shown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalRequest {
    pub task_id: TaskId,
    pub key: String,
    pub kind: TaskKind,
    pub round: usize,
    pub selected: CandidateId,
    pub worker: String,
    pub priority: Priority,
    pub total: f64,
    pub rationale: String,
    /// Start of the selected content.
    pub preview: String,
    pub alternatives: Vec<Alternative>,
}

impl ApprovalRequest {
    pub fn render(&self) -> String {
        let mut text = format!(
            "{} task {} (round {})\nSelected {} from {} ({}), score {:.2}\n{}\n\n{}\n",
            self.kind,
            self.key,
            self.round,
            self.selected,
            self.worker,
            self.priority,
            self.total,
            self.rationale,
            self.preview,
        );
        if !self.alternatives.is_empty() {
            text.push_str("\nAlternatives:\n");
            for alt in &self.alternatives {
                text.push_str(&format!("  slot {}: {} ({:.2})\n", alt.slot, alt.worker, alt.total));
            }
        }
        text
    }
}

#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    async fn decide(&self, request: &ApprovalRequest) -> Result<ApprovalDecision>;
}

/// Approves everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalChannel for AutoApprove {
    async fn decide(&self, _request: &ApprovalRequest) -> Result<ApprovalDecision> {
        Ok(ApprovalDecision::Approve)
    }
}

/// Replays a fixed list of decisions, then approves. Keeps every request.
#[derive(Debug, Default)]
pub struct ScriptedApproval {
    decisions: Mutex<VecDeque<ApprovalDecision>>,
    seen: Mutex<Vec<ApprovalRequest>>,
}

impl ScriptedApproval {
    pub fn new(decisions: impl IntoIterator<Item = ApprovalDecision>) -> Self {
        Self {
            decisions: Mutex::new(decisions.into_iter().collect()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ApprovalRequest> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl ApprovalChannel for ScriptedApproval {
    async fn decide(&self, request: &ApprovalRequest) -> Result<ApprovalDecision> {
        self.seen.lock().push(request.clone());
        Ok(self
            .decisions
            .lock()
            .pop_front()
            .unwrap_or(ApprovalDecision::Approve))
    }
}

/// Prompts on stdout and reads the answer from stdin.
///
/// End of input counts as a rejection.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleApproval;

#[async_trait]
impl ApprovalChannel for ConsoleApproval {
    async fn decide(&self, request: &ApprovalRequest) -> Result<ApprovalDecision> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        print!("{}", request.render());
        loop {
            print!("[y]es / [a] <slot> / [r]egenerate / [n]o > ");
            std::io::stdout().flush()?;
            let Some(line) = lines.next_line().await? else {
                return Ok(ApprovalDecision::Reject);
            };
            match line.parse() {
                Ok(decision) => return Ok(decision),
                Err(e) => println!("{e}"),
            }
        }
    }
}
