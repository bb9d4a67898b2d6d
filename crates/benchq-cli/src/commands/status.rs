//! `benchq status`

use anyhow::{Context, Result};
use benchq_coord::{JobEntry, JobGuard, JobStatus};
use benchq_core::Config;
use clap::{Args, ValueEnum};
use std::fmt::Write as _;

use crate::backend;

/// Arguments of `benchq status`
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Only print the summary line
    #[arg(short, long)]
    pub summary: bool,

    /// Only list jobs in this state
    #[arg(long, value_enum)]
    pub only: Option<StatusFilter>,
}

/// Job state selectable on the command line
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    /// Marked complete
    Completed,
    /// Locked by a worker
    InFlight,
    /// Neither complete nor locked
    Idle,
}

impl From<StatusFilter> for JobStatus {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::Completed => Self::Completed,
            StatusFilter::InFlight => Self::InFlight,
            StatusFilter::Idle => Self::Idle,
        }
    }
}

fn label(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Completed => "completed",
        JobStatus::InFlight => "in-flight",
        JobStatus::Idle => "idle",
    }
}

/// Renders an inventory as one line per job followed by totals
#[must_use]
pub fn render(entries: &[JobEntry], only: Option<StatusFilter>, summary: bool) -> String {
    let mut out = String::new();
    if !summary {
        for entry in entries
            .iter()
            .filter(|e| only.is_none_or(|o| JobStatus::from(o) == e.status))
        {
            let _ = writeln!(out, "{:<10} {}", label(entry.status), entry.key);
        }
    }
    let count = |status| entries.iter().filter(|e| e.status == status).count();
    let _ = writeln!(
        out,
        "{} jobs: {} completed, {} in flight, {} idle",
        entries.len(),
        count(JobStatus::Completed),
        count(JobStatus::InFlight),
        count(JobStatus::Idle)
    );
    out
}

/// Runs `benchq status`
///
/// # Errors
///
/// Returns an error if the coordination service is unreachable.
pub async fn run_status(config: &Config, args: &StatusArgs) -> Result<()> {
    let coord = backend::coordination(&config.coordination).await?;
    let guard = JobGuard::connect(coord, config.coordination.root.clone()).await?;
    let entries = guard.inventory().await.context("listing job nodes")?;
    print!("{}", render(&entries, args.only, args.summary));
    guard.close().await?;
    Ok(())
}
