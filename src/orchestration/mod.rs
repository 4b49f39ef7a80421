//! Orchestration layer.
//!
//! Registry and health feed the resolver; the dispatcher fans a task out to
//! one resolved worker; the controller sequences resolution, dispatch,
//! evaluation and persistence for a single task run.

mod controller;
pub mod detection;
mod dispatcher;
mod headless;
mod health;
mod registry;
mod resolver;
mod state;

pub use controller::{
    host_payload, worker_payload, AttemptOutcome, AttemptRecord, FailureReason, FailureReport,
    Orchestrator, PendingPlacement, PlacedArtifact, RunEvent, RunOutcome,
};
pub use detection::{detect, infer_capability, DetectionReport};
pub use dispatcher::{Batch, DispatchTarget, Dispatcher, CANCELLED_REASON};
pub use headless::{CommandWorker, PROMPT_FILE};
pub use health::{HealthSnapshot, HealthTable, Outcome};
pub use registry::{AgentRegistry, RegistryStats, WorkerProfile};
pub use resolver::{role_for, Preferences, ResolvedEntry, ResolvedWorkers, Resolver, Target};
pub use state::{RunState, RunStateMachine, StateHistoryEntry};
