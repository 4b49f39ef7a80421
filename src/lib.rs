pub mod config;
pub mod core;
pub mod error;
pub mod evaluation;
pub mod log;
pub mod orchestration;
pub mod persistence;
pub mod util;
pub mod worker;

pub use error::{Error, Result};
pub use orchestration::{Orchestrator, RunEvent, RunOutcome};
