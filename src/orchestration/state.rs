//! Run state machine with transition validation.
//!
//! One `RunStateMachine` tracks a single task run through the pipeline:
//!
//! Resolving -> Dispatching -> Evaluating -> (AwaitingApproval) -> Persisting -> Done
//!
//! `Escalating` is entered from Dispatching or Evaluating when a batch has
//! too few successes or no winner, and loops back to Dispatching with the
//! next resolved worker. `Failed` is terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::TaskId;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Resolving,
    Dispatching,
    Evaluating,
    AwaitingApproval,
    Escalating,
    Persisting,
    Done,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Resolving => "resolving",
            RunState::Dispatching => "dispatching",
            RunState::Evaluating => "evaluating",
            RunState::AwaitingApproval => "awaiting_approval",
            RunState::Escalating => "escalating",
            RunState::Persisting => "persisting",
            RunState::Done => "done",
            RunState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A record of a state transition with timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateHistoryEntry {
    pub state: RunState,
    pub entered_at: DateTime<Utc>,
}

/// Enforces valid transitions for one run and keeps their history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStateMachine {
    task: TaskId,
    current: RunState,
    history: Vec<StateHistoryEntry>,
}

impl RunStateMachine {
    /// Start a run in `Resolving`.
    pub fn new(task: TaskId) -> Self {
        Self {
            task,
            current: RunState::Resolving,
            history: vec![StateHistoryEntry {
                state: RunState::Resolving,
                entered_at: Utc::now(),
            }],
        }
    }

    pub fn can_transition(&self, target: RunState) -> bool {
        use RunState::*;
        matches!(
            (self.current, target),
            (Resolving, Dispatching)
                | (Resolving, Failed)
                | (Dispatching, Evaluating)
                | (Dispatching, Escalating)
                | (Dispatching, Failed)
                | (Evaluating, AwaitingApproval)
                | (Evaluating, Persisting)
                | (Evaluating, Escalating)
                | (Evaluating, Failed)
                | (AwaitingApproval, Persisting)
                | (AwaitingApproval, Dispatching)
                | (AwaitingApproval, Failed)
                | (Escalating, Dispatching)
                | (Escalating, Failed)
                | (Persisting, Done)
                | (Persisting, Failed)
        )
    }

    pub fn transition(&mut self, target: RunState) -> Result<()> {
        if !self.can_transition(target) {
            return Err(Error::InvalidStateTransition {
                from: self.current.to_string(),
                to: target.to_string(),
            });
        }

        info!(task = %self.task.short(), from = %self.current, to = %target, "state transition");
        self.current = target;
        self.history.push(StateHistoryEntry {
            state: target,
            entered_at: Utc::now(),
        });
        Ok(())
    }

    pub fn current(&self) -> RunState {
        self.current
    }

    pub fn history(&self) -> &[StateHistoryEntry] {
        &self.history
    }

    /// States visited, in order, without timestamps.
    pub fn path(&self) -> Vec<RunState> {
        self.history.iter().map(|e| e.state).collect()
    }
}
