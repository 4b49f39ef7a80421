//! Task dispatcher.
//!
//! The `Dispatcher` fans one payload out to `fanout` concurrent invocations
//! of a single worker and waits for every one of them. Each slot runs in its
//! own tokio task with its own workspace directory and output file, races
//! its own deadline, and records its own health outcome. A slot that times
//! out is dropped (which kills its process) without touching siblings.
//!
//! The dispatcher never fails: every slot yields exactly one [`Candidate`],
//! whatever happened to the invocation. Dropping a `dispatch` future before
//! it completes aborts every slot that is still running.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::{Candidate, CandidateId, CandidateStatus};
use crate::error::Error;
use crate::orchestration::{HealthTable, Outcome};
use crate::worker::{InvocationRequest, Priority, Worker, WorkerId};

/// Reason recorded on slots stopped by run cancellation.
pub const CANCELLED_REASON: &str = "cancelled";

/// The worker a batch goes to.
#[derive(Clone)]
pub struct DispatchTarget {
    pub id: WorkerId,
    pub name: String,
    pub priority: Priority,
    pub handle: Arc<dyn Worker>,
}

impl std::fmt::Debug for DispatchTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchTarget")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Shape of one dispatch batch.
#[derive(Debug, Clone, Copy)]
pub struct Batch {
    /// Batch number within the run, used in candidate ids.
    pub number: u32,
    pub fanout: usize,
    pub timeout: Duration,
}

/// Fans invocations out into a run's scratch directory.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    health: Arc<HealthTable>,
    scratch: PathBuf,
}

impl Dispatcher {
    /// `scratch` must be namespaced to a single run.
    pub fn new(health: Arc<HealthTable>, scratch: PathBuf) -> Self {
        Self { health, scratch }
    }

    pub fn scratch(&self) -> &Path {
        &self.scratch
    }

    /// Output file for a candidate.
    pub fn candidate_path(&self, id: CandidateId) -> PathBuf {
        self.scratch.join(format!("{id}.md"))
    }

    /// Run `batch.fanout` isolated invocations and wait for all of them.
    ///
    /// Returns candidates ordered by slot index.
    pub async fn dispatch(
        &self,
        payload: &str,
        target: &DispatchTarget,
        batch: Batch,
        cancel: &CancellationToken,
    ) -> Vec<Candidate> {
        info!(
            worker = %target.name,
            batch = batch.number,
            fanout = batch.fanout,
            timeout_secs = batch.timeout.as_secs(),
            "dispatching batch"
        );

        let payload: Arc<str> = Arc::from(payload);
        let handles: Vec<JoinHandle<Candidate>> = (0..batch.fanout)
            .map(|slot| {
                let id = CandidateId::new(batch.number, slot as u32);
                let slot_run = SlotRun {
                    id,
                    target: target.clone(),
                    request: InvocationRequest {
                        payload: payload.to_string(),
                        timeout: batch.timeout,
                        workspace: self.scratch.join(format!("{id}.work")),
                    },
                    output_path: self.candidate_path(id),
                    health: Arc::clone(&self.health),
                    cancel: cancel.child_token(),
                };
                tokio::spawn(slot_run.run())
            })
            .collect();

        let started_at = Utc::now();
        let _guard = SlotGuard(handles.iter().map(JoinHandle::abort_handle).collect());
        let results = join_all(handles).await;

        let candidates: Vec<Candidate> = results
            .into_iter()
            .enumerate()
            .map(|(slot, joined)| match joined {
                Ok(candidate) => candidate,
                Err(e) => {
                    warn!(worker = %target.name, slot, error = %e, "dispatch slot aborted");
                    self.health.record(
                        target.id,
                        &Outcome::Failure(format!("slot aborted: {e}")),
                        Duration::ZERO,
                    );
                    Candidate {
                        id: CandidateId::new(batch.number, slot as u32),
                        worker: target.id,
                        worker_name: target.name.clone(),
                        priority: target.priority,
                        status: CandidateStatus::Failed {
                            reason: format!("slot aborted: {e}"),
                        },
                        content: String::new(),
                        started_at,
                        elapsed: Duration::ZERO,
                        scratch_path: None,
                    }
                }
            })
            .collect();

        let succeeded = candidates.iter().filter(|c| c.is_succeeded()).count();
        info!(
            worker = %target.name,
            batch = batch.number,
            succeeded,
            fanout = batch.fanout,
            "batch complete"
        );
        candidates
    }
}

/// Aborts the slot tasks of a batch when dropped. Finished tasks ignore it.
struct SlotGuard(Vec<AbortHandle>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// Everything one slot owns. Nothing here is shared mutably with siblings.
struct SlotRun {
    id: CandidateId,
    target: DispatchTarget,
    request: InvocationRequest,
    output_path: PathBuf,
    health: Arc<HealthTable>,
    cancel: CancellationToken,
}

impl SlotRun {
    async fn run(self) -> Candidate {
        let started_at = Utc::now();
        let clock = Instant::now();
        let deadline = self.request.timeout;

        let invoked = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = tokio::time::timeout(deadline, self.target.handle.invoke(&self.request)) => Some(result),
        };
        let elapsed = clock.elapsed();

        let (status, content, scratch_path) = match invoked {
            None => {
                debug!(candidate = %self.id, worker = %self.target.name, "slot cancelled");
                (
                    CandidateStatus::Failed {
                        reason: CANCELLED_REASON.to_string(),
                    },
                    String::new(),
                    None,
                )
            }
            Some(Err(_)) | Some(Ok(Err(Error::InvocationTimeout(_)))) => {
                self.health.record(self.target.id, &Outcome::Timeout, elapsed);
                (CandidateStatus::TimedOut, String::new(), None)
            }
            Some(Ok(Err(e))) => {
                let reason = e.to_string();
                self.health
                    .record(self.target.id, &Outcome::Failure(reason.clone()), elapsed);
                (CandidateStatus::Failed { reason }, String::new(), None)
            }
            Some(Ok(Ok(text))) => {
                let written = tokio::fs::write(&self.output_path, &text).await;
                match written {
                    Ok(()) => {
                        self.health.record(self.target.id, &Outcome::Success, elapsed);
                        (CandidateStatus::Succeeded, text, Some(self.output_path.clone()))
                    }
                    Err(e) => {
                        let reason = format!("scratch write failed: {e}");
                        warn!(candidate = %self.id, error = %e, "could not write candidate output");
                        self.health
                            .record(self.target.id, &Outcome::Failure(reason.clone()), elapsed);
                        (CandidateStatus::Failed { reason }, String::new(), None)
                    }
                }
            }
        };

        info!(
            candidate = %self.id,
            worker = %self.target.name,
            status = status.label(),
            elapsed_ms = elapsed.as_millis() as u64,
            "invocation complete"
        );

        Candidate {
            id: self.id,
            worker: self.target.id,
            worker_name: self.target.name,
            priority: self.target.priority,
            status,
            content,
            started_at,
            elapsed,
            scratch_path,
        }
    }
}
