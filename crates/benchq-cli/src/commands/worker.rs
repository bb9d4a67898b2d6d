//! `benchq worker`

use anyhow::{Context, Result};
use benchq_coord::JobGuard;
use benchq_core::Config;
use benchq_worker::{CommandRunner, Worker};
use clap::Args;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::{shutdown_signal, stopped};
use crate::backend;

/// Arguments of `benchq worker`
#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Pod identifier reported in completion events
    #[arg(long)]
    pub pod_id: Option<String>,

    /// Thread-count hint
    #[arg(long)]
    pub threads: Option<u32>,

    /// Program run for each job
    #[arg(long)]
    pub program: Option<String>,

    /// Argument template for the program; repeat for several
    #[arg(long = "arg", allow_hyphen_values = true)]
    pub args: Vec<String>,
}

impl WorkerArgs {
    fn apply(self, config: &mut Config) {
        if let Some(pod_id) = self.pod_id {
            config.worker.pod_id = pod_id;
        }
        if let Some(threads) = self.threads {
            config.worker.threads = threads;
        }
        if let Some(program) = self.program {
            config.worker.runner_program = program;
        }
        if !self.args.is_empty() {
            config.worker.runner_args = self.args;
        }
    }
}

/// Runs a worker until Ctrl-C
///
/// A lost coordination session is replaced by a new one after the
/// resubscribe backoff; only the first connection is required to succeed.
///
/// # Errors
///
/// Returns an error if the backends are unavailable at startup.
pub async fn run_worker(mut config: Config, args: WorkerArgs) -> Result<()> {
    args.apply(&mut config);
    info!(
        pod = %config.worker.pod_id,
        threads = config.worker.threads,
        zk = %config.coordination.hosts,
        brokers = %config.queue.brokers,
        "worker configuration"
    );

    let consumer = backend::consumer(&config.queue)?;
    let producer = backend::producer(&config.queue)?;
    let runner = Arc::new(CommandRunner::new(&config.worker));
    let shutdown = shutdown_signal();
    let backoff = config.worker.resubscribe_backoff();

    let mut first = true;
    loop {
        let guard = match connect_guard(&config).await {
            Ok(guard) => Arc::new(guard),
            Err(e) if first => return Err(e),
            Err(e) => {
                error!(error = %format!("{e:#}"), "reconnect failed");
                tokio::select! {
                    () = stopped(shutdown.clone()) => return Ok(()),
                    () = tokio::time::sleep(backoff) => continue,
                }
            }
        };
        first = false;

        let worker = Worker::new(
            &config,
            guard,
            Arc::clone(&consumer),
            Arc::clone(&producer),
            runner.clone(),
        );
        match worker.run_until(stopped(shutdown.clone())).await {
            Ok(stats) => {
                info!(?stats, "worker finished");
                if let Err(e) = worker.close().await {
                    warn!(error = %e, "unclean shutdown");
                }
                return Ok(());
            }
            Err(e) => {
                error!(error = %e, "coordination session lost; reconnecting");
                tokio::select! {
                    () = stopped(shutdown.clone()) => return Ok(()),
                    () = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
}

async fn connect_guard(config: &Config) -> Result<JobGuard> {
    let coord = backend::coordination(&config.coordination).await?;
    JobGuard::connect(coord, config.coordination.root.clone())
        .await
        .with_context(|| format!("preparing job root {}", config.coordination.root))
}
