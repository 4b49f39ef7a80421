//! The worker boundary.
//!
//! A worker is an opaque external agent: it receives a text payload and
//! either returns text or fails. Everything non-deterministic about a run
//! lives behind [`Worker::invoke`].

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Stable index of a worker in the registry arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub usize);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// What a worker is specialised for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerRole {
    /// Produces designs and elaborations.
    Architect,
    /// Produces implementations.
    Developer,
    /// Takes any kind of task.
    Generic,
}

impl WorkerRole {
    /// Whether a worker with this role can serve a task needing `needed`.
    pub fn covers(&self, needed: WorkerRole) -> bool {
        *self == needed || *self == WorkerRole::Generic
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerRole::Architect => "architect",
            WorkerRole::Developer => "developer",
            WorkerRole::Generic => "generic",
        }
    }
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Position of a worker in a resolved list. Lower wins ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Primary = 0,
    Fallback = 1,
    Generic = 2,
    Host = 3,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Primary => "primary",
            Priority::Fallback => "fallback",
            Priority::Generic => "generic",
            Priority::Host => "host",
        };
        write!(f, "{s}")
    }
}

/// One invocation of a worker.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    /// Task description plus rubric context, identical across a batch.
    pub payload: String,
    /// Hard deadline enforced by the caller.
    pub timeout: Duration,
    /// Directory owned by this invocation alone.
    pub workspace: PathBuf,
}

/// An external agent that turns a payload into text.
///
/// Implementations must be safe to invoke concurrently; the dispatcher
/// calls the same worker from several slots at once. Dropping the returned
/// future must stop the underlying work.
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, request: &InvocationRequest) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(Priority::Primary < Priority::Fallback);
        assert!(Priority::Fallback < Priority::Generic);
        assert!(Priority::Generic < Priority::Host);
    }

    #[test]
    fn test_role_serde() {
        let role: WorkerRole = serde_json::from_str("\"developer\"").unwrap();
        assert_eq!(role, WorkerRole::Developer);
        assert_eq!(WorkerRole::Generic.to_string(), "generic");
    }

    #[test]
    fn test_worker_id_display() {
        assert_eq!(WorkerId(3).to_string(), "w3");
    }
}
