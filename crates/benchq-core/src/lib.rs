//! # benchq Core
//!
//! Shared building blocks for benchq workers: the configuration model, the
//! wire schema of job descriptors and completion events, and logging setup.
//!
//! ## Architecture
//!
//! - `config`: Explicit configuration, built once at process start
//! - `job`: Job descriptors, job keys and completion events
//! - `logging`: `tracing` subscriber initialization
//!
//! ## Example
//!
//! ```rust,ignore
//! use benchq_core::{Config, JobDescriptor};
//!
//! let config = Config::from_env()?;
//! let job = JobDescriptor::decode(payload)?;
//! println!("{}", job.key());
//! ```

#![warn(missing_docs)]
#![warn(unused)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod job;
pub mod logging;

pub use config::{Config, CoordinationConfig, QueueConfig, WorkerSettings};
pub use job::{CompletionEvent, Hardware, JobDescriptor, JobKey};
pub use logging::init_logging;

/// Core error type
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct CoreError(#[from] CoreErrorKind);

/// Specific core error kinds
#[derive(Debug, thiserror::Error)]
pub enum CoreErrorKind {
    /// The payload is not a valid job descriptor
    #[error("malformed job message: {reason}")]
    MalformedMessage {
        /// What was wrong with the payload
        reason: String,
    },

    /// The dataset identifier cannot be turned into a job key
    #[error("invalid job key '{raw}': {reason}")]
    InvalidJobKey {
        /// Identifier as received
        raw: String,
        /// Why it was rejected
        reason: &'static str,
    },

    /// A configuration value could not be read or parsed
    #[error("invalid configuration: {reason}")]
    Config {
        /// Description of the offending value
        reason: String,
    },

    /// I/O failure while reading configuration
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Returns the underlying error kind
    #[must_use]
    pub fn kind(&self) -> &CoreErrorKind {
        &self.0
    }

    /// Returns true if this error describes a message that can never be
    /// processed, no matter how often it is redelivered
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        matches!(
            self.0,
            CoreErrorKind::MalformedMessage { .. } | CoreErrorKind::InvalidJobKey { .. }
        )
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self(CoreErrorKind::MalformedMessage {
            reason: reason.into(),
        })
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self(CoreErrorKind::Config {
            reason: reason.into(),
        })
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        Self(CoreErrorKind::Io(e))
    }
}

/// Core result type
pub type CoreResult<T = ()> = Result<T, CoreError>;

/// Version of the benchq crates
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
