//! Job execution collaborators.

use async_trait::async_trait;
use benchq_core::{JobDescriptor, WorkerSettings};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{WorkerError, WorkerResult};

/// Runs one job to completion
///
/// Implementations block for as long as the job takes. An `Err` means the
/// job did not finish and must stay eligible for another attempt.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Executes `job`
    async fn run(&self, job: &JobDescriptor) -> WorkerResult;
}

/// Runs each job as a child process
///
/// Arguments may contain the placeholders `{dataset}`, `{data}`, `{hw}`,
/// `{threads}`, `{ompcpus}` and `{key}`. `{threads}` is this worker's own
/// thread count, which the child also gets as `OMP_NUM_THREADS`; `{ompcpus}`
/// is the hint carried by the job message. `POD_ID` is set to this worker's
/// pod id.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
    pod_id: String,
    threads: u32,
}

impl CommandRunner {
    /// Creates a runner from the worker settings
    #[must_use]
    pub fn new(settings: &WorkerSettings) -> Self {
        Self {
            program: settings.runner_program.clone(),
            args: settings.runner_args.clone(),
            pod_id: settings.pod_id.clone(),
            threads: settings.threads,
        }
    }

    /// Replaces the program and its argument templates
    #[must_use]
    pub fn with_command(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.program = program.into();
        self.args = args;
        self
    }

    /// Arguments for `job` with every placeholder substituted
    #[must_use]
    pub fn render_args(&self, job: &JobDescriptor) -> Vec<String> {
        let threads = self.threads.to_string();
        let ompcpus = job.threads.to_string();
        let hw = job.hardware.to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{dataset}", &job.dataset)
                    .replace("{data}", &job.data)
                    .replace("{hw}", &hw)
                    .replace("{threads}", &threads)
                    .replace("{ompcpus}", &ompcpus)
                    .replace("{key}", job.key().as_str())
            })
            .collect()
    }
}

#[async_trait]
impl JobRunner for CommandRunner {
    async fn run(&self, job: &JobDescriptor) -> WorkerResult {
        let args = self.render_args(job);
        debug!(key = %job.key(), program = %self.program, ?args, "spawning job");

        let output = Command::new(&self.program)
            .args(&args)
            .env("OMP_NUM_THREADS", self.threads.to_string())
            .env("POD_ID", &self.pod_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| WorkerError::execution(format!("failed to spawn {}: {e}", self.program)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            info!(key = %job.key(), pod = %self.pod_id, "{line}");
        }

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.lines().last().unwrap_or_default().trim();
        warn!(key = %job.key(), status = %output.status, "job process failed");
        Err(WorkerError::execution(if detail.is_empty() {
            format!("{} exited with {}", self.program, output.status)
        } else {
            format!("{} exited with {}: {detail}", self.program, output.status)
        }))
    }
}
