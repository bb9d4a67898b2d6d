//! # benchq CLI
//!
//! Command-line interface for benchq workers.
//!
//! ## Usage
//!
//! ```bash
//! # Run a worker against ZooKeeper and Kafka
//! POD_ID=3 OMP_NUM_THREADS=8 benchq worker
//!
//! # Publish 20 jobs with Poisson-distributed gaps
//! benchq submit -n 20 --dataset higgs1m --lambda 2
//!
//! # Try the protocol locally without external services
//! benchq demo --workers 4 --jobs 10 --duplicates 5
//! ```

#![warn(missing_docs)]
#![warn(unused)]

pub mod backend;
pub mod commands;

pub use commands::run;

/// CLI result type
pub type CliResult<T = ()> = Result<T, anyhow::Error>;
