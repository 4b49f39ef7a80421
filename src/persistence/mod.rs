pub mod approval;
pub mod manager;
pub mod store;

pub use approval::{
    ApprovalChannel, ApprovalDecision, ApprovalRequest, AutoApprove, ConsoleApproval,
    ScriptedApproval,
};
pub use manager::{PersistenceManager, PersistenceOutcome, RunArtifacts, Selection};
pub use store::{ArchiveIndex, ArchiveRecord, PlacementMetadata, StorageStats, Store};
