//! One worker's attempt at a task.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::worker::{Priority, WorkerId};

/// Identifies a candidate within a run: dispatch batch plus slot index.
///
/// Batches count up across escalations and regenerations, so ids never
/// collide inside one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CandidateId {
    pub batch: u32,
    pub slot: u32,
}

impl CandidateId {
    pub fn new(batch: u32, slot: u32) -> Self {
        Self { batch, slot }
    }
}

impl std::fmt::Display for CandidateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b{}-s{}", self.batch, self.slot)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CandidateStatus {
    Pending,
    Succeeded,
    Failed { reason: String },
    TimedOut,
}

impl CandidateStatus {
    pub fn is_succeeded(&self) -> bool {
        matches!(self, CandidateStatus::Succeeded)
    }

    pub fn label(&self) -> &'static str {
        match self {
            CandidateStatus::Pending => "pending",
            CandidateStatus::Succeeded => "succeeded",
            CandidateStatus::Failed { .. } => "failed",
            CandidateStatus::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub id: CandidateId,
    pub worker: WorkerId,
    pub worker_name: String,
    pub priority: Priority,
    pub status: CandidateStatus,
    /// Raw output. Empty unless the invocation succeeded.
    pub content: String,
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    /// Transient copy of `content` in the run's scratch directory.
    pub scratch_path: Option<PathBuf>,
}

impl Candidate {
    pub fn is_succeeded(&self) -> bool {
        self.status.is_succeeded()
    }

    pub fn slot(&self) -> u32 {
        self.id.slot
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
