//! # benchq Worker
//!
//! The long-running loop that turns work-topic messages into guarded job
//! executions and completion events.
//!
//! ## Architecture
//!
//! - `worker`: The [`Worker`] loop and per-message [`JobOutcome`]
//! - `runner`: The [`JobRunner`] execution collaborator and the
//!   process-spawning [`CommandRunner`]
//! - `state`: Outcome counters shared with the caller
//!
//! ## Example
//!
//! ```rust,ignore
//! use benchq_worker::{CommandRunner, Worker};
//!
//! let worker = Worker::new(&config, guard, consumer, producer, Arc::new(CommandRunner::new(&config.worker)));
//! worker.run_until(tokio::signal::ctrl_c().map(|_| ())).await?;
//! ```

#![warn(missing_docs)]
#![warn(unused)]
#![warn(clippy::pedantic)]

pub mod runner;
pub mod state;
pub mod worker;

pub use runner::{CommandRunner, JobRunner};
pub use state::{StatsSnapshot, WorkerStats};
pub use worker::{JobOutcome, SkipReason, Worker};

use benchq_coord::GuardError;
use benchq_core::CoreError;
use benchq_queue::QueueError;

/// Worker error type
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct WorkerError(#[from] WorkerErrorKind);

/// Specific worker error kinds
#[derive(Debug, thiserror::Error)]
pub enum WorkerErrorKind {
    /// The execution collaborator failed
    #[error("execution failed: {reason}")]
    Execution {
        /// What went wrong
        reason: String,
    },

    /// A job message could not be decoded
    #[error(transparent)]
    Malformed(#[from] CoreError),

    /// The job guard failed
    #[error(transparent)]
    Guard(#[from] GuardError),

    /// The queue client failed
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl WorkerError {
    /// Returns the underlying error kind
    #[must_use]
    pub fn kind(&self) -> &WorkerErrorKind {
        &self.0
    }

    /// Returns true if the loop can carry on after this error
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match &self.0 {
            WorkerErrorKind::Execution { .. } | WorkerErrorKind::Malformed(_) => true,
            WorkerErrorKind::Guard(e) => e.is_transient(),
            WorkerErrorKind::Queue(e) => e.is_transient(),
        }
    }

    /// Creates an execution failure
    pub fn execution(reason: impl Into<String>) -> Self {
        Self(WorkerErrorKind::Execution {
            reason: reason.into(),
        })
    }
}

impl From<GuardError> for WorkerError {
    fn from(e: GuardError) -> Self {
        Self(WorkerErrorKind::Guard(e))
    }
}

impl From<QueueError> for WorkerError {
    fn from(e: QueueError) -> Self {
        Self(WorkerErrorKind::Queue(e))
    }
}

impl From<CoreError> for WorkerError {
    fn from(e: CoreError) -> Self {
        Self(WorkerErrorKind::Malformed(e))
    }
}

/// Worker result type
pub type WorkerResult<T = ()> = Result<T, WorkerError>;
