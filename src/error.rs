use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::orchestration::FailureReport;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Config error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Invocation timed out after {0:?}")]
    InvocationTimeout(Duration),

    #[error("Invocation failed: {0}")]
    InvocationFailure(String),

    #[error("Insufficient successes: {succeeded} succeeded, {required} required")]
    InsufficientSuccesses { succeeded: usize, required: usize },

    #[error("Structural violation: missing {missing:?}, extra {extra:?}")]
    StructuralViolation {
        missing: Vec<String>,
        extra: Vec<String>,
    },

    #[error("No winner: {0}")]
    NoWinner(String),

    #[error("Placement failed: {0}")]
    PlacementFailure(String),

    #[error("Resolution exhausted after {} attempt(s)", .0.attempts.len())]
    ExhaustedResolution(Box<FailureReport>),

    #[error("Run aborted: {0}")]
    Aborted(String),

    #[error("Scratch artifact missing: {0}")]
    ScratchMissing(PathBuf),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Whether this error came from a single invocation and is absorbed
    /// into the candidate rather than propagated.
    pub fn is_invocation_error(&self) -> bool {
        matches!(
            self,
            Error::InvocationTimeout(_) | Error::InvocationFailure(_) | Error::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
