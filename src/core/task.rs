//! Task data model.
//!
//! A task is the unit of requested work. It is built once from a
//! submission and never mutated after dispatch; every stage of a run reads
//! the same `Arc<Task>`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::Language;
use crate::error::{Error, Result};
use crate::evaluation::Outline;

/// Unique identifier for a task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// What the workers are asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// A top-level design document.
    Design,
    /// A detailed specification of one section of an existing design.
    Elaboration,
    /// A code artifact.
    Implementation,
}

impl TaskKind {
    pub const ALL: [TaskKind; 3] = [
        TaskKind::Design,
        TaskKind::Elaboration,
        TaskKind::Implementation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Design => "design",
            TaskKind::Elaboration => "elaboration",
            TaskKind::Implementation => "implementation",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "design" => Ok(TaskKind::Design),
            "elaboration" | "feat" | "feature" => Ok(TaskKind::Elaboration),
            "implementation" | "dev" | "code" => Ok(TaskKind::Implementation),
            other => Err(Error::Validation(format!("unknown task kind: {other}"))),
        }
    }
}

/// A request as handed over by the command layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub description: String,
    #[serde(default)]
    pub capability_hint: Option<String>,
    pub kind: TaskKind,
    #[serde(default)]
    pub structural_constraint: Option<Outline>,
    /// Permanent storage key. Derived from kind and description when absent.
    #[serde(default)]
    pub key: Option<String>,
    /// Explicit worker override, tried before any resolved worker.
    #[serde(default)]
    pub worker_override: Option<String>,
}

impl TaskSubmission {
    pub fn new(description: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            description: description.into(),
            capability_hint: None,
            kind,
            structural_constraint: None,
            key: None,
            worker_override: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.capability_hint = Some(hint.into());
        self
    }

    pub fn with_outline(mut self, outline: Outline) -> Self {
        self.structural_constraint = Some(outline);
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker_override = Some(worker.into());
        self
    }
}

/// An immutable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Identity of the artifact in permanent storage.
    pub key: String,
    pub description: String,
    pub capability: Option<Language>,
    pub kind: TaskKind,
    pub outline: Option<Outline>,
    pub worker_override: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Build a task from a submission whose capability was already resolved.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty description or an explicit
    /// key containing characters outside `[a-z0-9_-]`.
    pub fn from_submission(submission: TaskSubmission, capability: Option<Language>) -> Result<Self> {
        let description = submission.description.trim().to_string();
        if description.is_empty() {
            return Err(Error::Validation("task description is empty".to_string()));
        }

        let key = match submission.key {
            Some(key) => {
                validate_key(&key)?;
                key
            }
            None => derive_key(submission.kind, &description),
        };

        Ok(Self {
            id: TaskId::new(),
            key,
            description,
            capability,
            kind: submission.kind,
            outline: submission.structural_constraint,
            worker_override: submission.worker_override,
            created_at: Utc::now(),
        })
    }
}

fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!("invalid task key: {key:?}")))
    }
}

/// `design_timer_app_with_pause`, at most six words of the description.
fn derive_key(kind: TaskKind, description: &str) -> String {
    let slug: Vec<String> = description
        .split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .take(6)
        .collect();

    if slug.is_empty() {
        kind.as_str().to_string()
    } else {
        format!("{}_{}", kind.as_str(), slug.join("_"))
    }
}
