//! # benchq Coordination
//!
//! Distributed mutual exclusion and completion tracking for benchmark jobs,
//! built on a hierarchical coordination service with ephemeral nodes.
//!
//! ## Architecture
//!
//! - `client`: The [`Coordination`] trait every backend implements
//! - `path`: Namespace path helpers
//! - `memory`: In-process ensemble used by tests and the local demo
//! - `zookeeper`: ZooKeeper backend (feature `zookeeper`)
//! - `guard`: The per-job state machine ([`JobGuard`])
//!
//! ## Node layout
//!
//! ```text
//! <root>/<job key>/processing   ephemeral, held while a worker runs the job
//! <root>/<job key>/complete     persistent, created once the job finished
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use benchq_coord::{JobGuard, MemoryEnsemble, StartOutcome};
//!
//! let ensemble = MemoryEnsemble::new();
//! let guard = JobGuard::connect(Arc::new(ensemble.connect()), "/benchq/jobs").await?;
//! if let StartOutcome::Granted(lease) = guard.start(&key).await? {
//!     run_job().await;
//!     guard.end(&lease).await?;
//! }
//! ```

#![warn(missing_docs)]
#![warn(unused)]
#![warn(clippy::pedantic)]

pub mod client;
pub mod guard;
pub mod memory;
pub mod path;
#[cfg(feature = "zookeeper")]
pub mod zookeeper;

pub use client::{Coordination, CreateOutcome, DeleteOutcome};
pub use guard::{COMPLETE_MARKER, JobEntry, JobGuard, JobLease, JobStatus, PROCESSING_MARKER, StartOutcome};
pub use memory::{MemoryEnsemble, MemorySession};
#[cfg(feature = "zookeeper")]
pub use zookeeper::ZkCoordination;

use benchq_core::JobKey;

/// Coordination client error
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct CoordError(#[from] CoordErrorKind);

/// Specific coordination error kinds
#[derive(Debug, thiserror::Error)]
pub enum CoordErrorKind {
    /// The service could not be reached or did not answer in time
    #[error("coordination service unavailable: {reason}")]
    Unavailable {
        /// Backend-specific detail
        reason: String,
    },

    /// The session ended; every ephemeral node it held is gone
    #[error("coordination session expired")]
    SessionExpired,

    /// The client was closed by its owner
    #[error("coordination session closed")]
    Closed,

    /// A node was created under a parent that does not exist
    #[error("parent of '{path}' does not exist")]
    NoParent {
        /// Path whose parent is missing
        path: String,
    },

    /// The path is not a valid namespace path
    #[error("invalid path '{path}': {reason}")]
    InvalidPath {
        /// Offending path
        path: String,
        /// Why it was rejected
        reason: &'static str,
    },

    /// Any other backend failure
    #[error("coordination backend error: {reason}")]
    Backend {
        /// Backend-specific detail
        reason: String,
    },
}

impl CoordError {
    /// Returns the underlying error kind
    #[must_use]
    pub fn kind(&self) -> &CoordErrorKind {
        &self.0
    }

    /// Returns true if retrying later with the same session may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self.0, CoordErrorKind::Unavailable { .. })
    }

    pub(crate) fn unavailable(reason: impl Into<String>) -> Self {
        Self(CoordErrorKind::Unavailable {
            reason: reason.into(),
        })
    }

    pub(crate) fn backend(reason: impl Into<String>) -> Self {
        Self(CoordErrorKind::Backend {
            reason: reason.into(),
        })
    }
}

/// Coordination result type
pub type CoordResult<T = ()> = Result<T, CoordError>;

/// Job guard error
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct GuardError(#[from] GuardErrorKind);

/// Specific job guard error kinds
#[derive(Debug, thiserror::Error)]
pub enum GuardErrorKind {
    /// The coordination service failed; the state of the job is unknown
    #[error(transparent)]
    Coordination(#[from] CoordError),

    /// `end` or `abort` was called with a lease this guard does not hold
    #[error("lease for job '{key}' is not held by this guard")]
    LeaseNotHeld {
        /// Job named by the lease
        key: JobKey,
    },
}

impl GuardError {
    /// Returns the underlying error kind
    #[must_use]
    pub fn kind(&self) -> &GuardErrorKind {
        &self.0
    }

    /// Returns true if the operation may succeed when attempted again
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(&self.0, GuardErrorKind::Coordination(e) if e.is_transient())
    }
}

impl From<CoordError> for GuardError {
    fn from(e: CoordError) -> Self {
        Self(GuardErrorKind::Coordination(e))
    }
}

/// Job guard result type
pub type GuardResult<T = ()> = Result<T, GuardError>;
