//! Core domain models: tasks, languages and candidates.

pub mod candidate;
pub mod language;
pub mod task;

pub use candidate::{Candidate, CandidateId, CandidateStatus};
pub use language::Language;
pub use task::{Task, TaskId, TaskKind, TaskSubmission};
