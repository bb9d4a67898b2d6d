//! `benchq` - exactly-once benchmark job workers
//!
//! ## Commands
//!
//! - `benchq worker` - Consume the work topic and run each job once
//! - `benchq submit` - Publish benchmark jobs to the work topic
//! - `benchq status` - List job nodes and their state
//! - `benchq demo` - Run an in-process fleet against in-memory services

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match benchq_cli::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
