//! Worker health tracking.
//!
//! The `HealthTable` holds one record per worker, indexed by [`WorkerId`].
//! Counters are atomics so concurrent dispatch slots, possibly from
//! different runs, can record outcomes without a table-wide lock. The
//! sliding window and latency average sit behind a per-record mutex.
//!
//! ## Availability
//!
//! A worker is unavailable when it was marked so explicitly, or when its
//! live window holds at least `min_samples` outcomes and the share of
//! failures and timeouts in it reaches `failure_ratio`. Window entries older
//! than `window_ttl_secs` are ignored, so automatic unavailability lapses
//! on its own once the bad outcomes age out.
//!
//! Readers may observe slightly stale data; an outcome recorded while the
//! resolver runs is simply picked up by the next resolution.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::HealthConfig;
use crate::worker::WorkerId;

/// How many failure messages each record keeps.
pub const RECENT_FAILURES: usize = 5;

/// Weight of the previous average in the latency EWMA.
const LATENCY_DECAY: f64 = 0.8;

/// Outcome of one invocation, as seen by the health table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(String),
    Timeout,
}

impl Outcome {
    fn is_bad(&self) -> bool {
        !matches!(self, Outcome::Success)
    }
}

#[derive(Debug, Default)]
struct Window {
    entries: VecDeque<(Instant, bool)>,
    avg_latency_ms: Option<f64>,
    recent_failures: VecDeque<String>,
}

#[derive(Debug, Default)]
struct HealthRecord {
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    last_latency_ms: AtomicU64,
    marked_unavailable: AtomicBool,
    window: Mutex<Window>,
}

/// Point-in-time view of one worker's health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub worker: WorkerId,
    pub available: bool,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub last_latency_ms: u64,
    pub avg_latency_ms: Option<f64>,
    /// Outcomes currently inside the window.
    pub window_samples: usize,
    pub window_failure_ratio: f64,
    pub recent_failures: Vec<String>,
}

/// Thread-safe health records for every worker in a registry.
#[derive(Debug)]
pub struct HealthTable {
    records: Vec<HealthRecord>,
    config: HealthConfig,
}

impl HealthTable {
    /// Create a table with `workers` empty records.
    pub fn new(workers: usize, config: HealthConfig) -> Self {
        let records = (0..workers).map(|_| HealthRecord::default()).collect();
        Self { records, config }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record one completed invocation.
    pub fn record(&self, worker: WorkerId, outcome: &Outcome, latency: Duration) {
        self.record_at(worker, outcome, latency, Instant::now());
    }

    pub fn record_at(&self, worker: WorkerId, outcome: &Outcome, latency: Duration, at: Instant) {
        let Some(record) = self.records.get(worker.0) else {
            debug!(worker = %worker, "health record for unknown worker ignored");
            return;
        };

        match outcome {
            Outcome::Success => record.successes.fetch_add(1, Ordering::Relaxed),
            Outcome::Failure(_) => record.failures.fetch_add(1, Ordering::Relaxed),
            Outcome::Timeout => record.timeouts.fetch_add(1, Ordering::Relaxed),
        };
        let latency_ms = latency.as_millis() as u64;
        record.last_latency_ms.store(latency_ms, Ordering::Relaxed);

        let mut window = record.window.lock();
        window.entries.push_back((at, outcome.is_bad()));
        while window.entries.len() > self.config.window {
            window.entries.pop_front();
        }
        window.avg_latency_ms = Some(match window.avg_latency_ms {
            Some(avg) => LATENCY_DECAY * avg + (1.0 - LATENCY_DECAY) * latency_ms as f64,
            None => latency_ms as f64,
        });
        if let Outcome::Failure(message) = outcome {
            window.recent_failures.push_back(message.clone());
            while window.recent_failures.len() > RECENT_FAILURES {
                window.recent_failures.pop_front();
            }
        }
    }

    pub fn is_available(&self, worker: WorkerId) -> bool {
        self.is_available_at(worker, Instant::now())
    }

    pub fn is_available_at(&self, worker: WorkerId, now: Instant) -> bool {
        let Some(record) = self.records.get(worker.0) else {
            return true;
        };
        if record.marked_unavailable.load(Ordering::Relaxed) {
            return false;
        }
        let window = record.window.lock();
        let (samples, ratio) = self.live_window(&window, now);
        !(samples >= self.config.min_samples && ratio >= self.config.failure_ratio)
    }

    /// Sample count and failure ratio of entries younger than the TTL.
    fn live_window(&self, window: &Window, now: Instant) -> (usize, f64) {
        let ttl = self.config.ttl();
        let live: Vec<bool> = window
            .entries
            .iter()
            .filter(|(at, _)| now.saturating_duration_since(*at) <= ttl)
            .map(|(_, bad)| *bad)
            .collect();
        if live.is_empty() {
            return (0, 0.0);
        }
        let bad = live.iter().filter(|b| **b).count();
        (live.len(), bad as f64 / live.len() as f64)
    }

    pub fn mark_unavailable(&self, worker: WorkerId) {
        if let Some(record) = self.records.get(worker.0) {
            record.marked_unavailable.store(true, Ordering::Relaxed);
            info!(worker = %worker, "worker marked unavailable");
        }
    }

    pub fn mark_available(&self, worker: WorkerId) {
        if let Some(record) = self.records.get(worker.0) {
            record.marked_unavailable.store(false, Ordering::Relaxed);
            info!(worker = %worker, "worker marked available");
        }
    }

    /// Clear counters, window and manual flag for one worker.
    pub fn reset(&self, worker: WorkerId) {
        if let Some(record) = self.records.get(worker.0) {
            record.successes.store(0, Ordering::Relaxed);
            record.failures.store(0, Ordering::Relaxed);
            record.timeouts.store(0, Ordering::Relaxed);
            record.last_latency_ms.store(0, Ordering::Relaxed);
            record.marked_unavailable.store(false, Ordering::Relaxed);
            *record.window.lock() = Window::default();
            info!(worker = %worker, "worker health reset");
        }
    }

    pub fn snapshot(&self, worker: WorkerId) -> Option<HealthSnapshot> {
        let record = self.records.get(worker.0)?;
        let now = Instant::now();
        let window = record.window.lock();
        let (window_samples, window_failure_ratio) = self.live_window(&window, now);
        let marked = record.marked_unavailable.load(Ordering::Relaxed);
        Some(HealthSnapshot {
            worker,
            available: !marked
                && !(window_samples >= self.config.min_samples
                    && window_failure_ratio >= self.config.failure_ratio),
            successes: record.successes.load(Ordering::Relaxed),
            failures: record.failures.load(Ordering::Relaxed),
            timeouts: record.timeouts.load(Ordering::Relaxed),
            last_latency_ms: record.last_latency_ms.load(Ordering::Relaxed),
            avg_latency_ms: window.avg_latency_ms,
            window_samples,
            window_failure_ratio,
            recent_failures: window.recent_failures.iter().cloned().collect(),
        })
    }
}
