//! Worker outcome counters.

use benchq_core::JobKey;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::worker::{JobOutcome, SkipReason};

/// Outcome counters for one worker
///
/// Clones share the same counters, so a caller can keep a handle while the
/// worker runs.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    completed: Arc<DashMap<JobKey, Duration>>,
    skipped_complete: Arc<AtomicUsize>,
    skipped_locked: Arc<AtomicUsize>,
    aborted: Arc<AtomicUsize>,
    coordination_retries: Arc<AtomicUsize>,
    rejected: Arc<AtomicUsize>,
    publish_failures: Arc<AtomicUsize>,
}

impl WorkerStats {
    /// Creates empty counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one outcome
    pub fn record(&self, outcome: &JobOutcome) {
        let counter = match outcome {
            JobOutcome::Completed { key, duration } => {
                self.completed.insert(key.clone(), *duration);
                return;
            }
            JobOutcome::Skipped {
                reason: SkipReason::AlreadyComplete,
                ..
            } => &self.skipped_complete,
            JobOutcome::Skipped {
                reason: SkipReason::LockHeldByOther,
                ..
            } => &self.skipped_locked,
            JobOutcome::Aborted { .. } => &self.aborted,
            JobOutcome::Rejected { .. } => &self.rejected,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    /// Counts one guard call repeated because coordination was unreachable
    pub fn record_coordination_retry(&self) {
        self.coordination_retries.fetch_add(1, Ordering::SeqCst);
    }

    /// Counts a completion event that could not be published
    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::SeqCst);
    }

    /// Jobs this worker completed, with their durations
    #[must_use]
    pub fn completed_jobs(&self) -> Vec<(JobKey, Duration)> {
        let mut jobs: Vec<_> = self
            .completed
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        jobs.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        jobs
    }

    /// Returns a point-in-time copy of the counters
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            completed: self.completed.len(),
            skipped_complete: self.skipped_complete.load(Ordering::SeqCst),
            skipped_locked: self.skipped_locked.load(Ordering::SeqCst),
            aborted: self.aborted.load(Ordering::SeqCst),
            coordination_retries: self.coordination_retries.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::SeqCst),
            publish_failures: self.publish_failures.load(Ordering::SeqCst),
        }
    }
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Jobs executed and marked complete
    pub completed: usize,
    /// Messages for jobs that were already complete
    pub skipped_complete: usize,
    /// Messages for jobs locked by another worker
    pub skipped_locked: usize,
    /// Jobs whose execution failed
    pub aborted: usize,
    /// Guard calls repeated while coordination was unreachable
    pub coordination_retries: usize,
    /// Malformed messages
    pub rejected: usize,
    /// Completion events that failed to publish
    pub publish_failures: usize,
}

impl StatsSnapshot {
    /// Total messages handled
    #[must_use]
    pub fn handled(&self) -> usize {
        self.completed
            + self.skipped_complete
            + self.skipped_locked
            + self.aborted
            + self.rejected
    }
}
