//! CLI commands for benchq.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::future::Future;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{info, warn};

use benchq_core::{Config, init_logging};

pub mod demo;
pub mod status;
pub mod submit;
pub mod worker;

/// Exactly-once benchmark job workers
#[derive(Parser, Debug)]
#[command(name = "benchq")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true, env = "BENCHQ_CONFIG")]
    config: Option<PathBuf>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Consume the work topic and run each job exactly once
    #[command(name = "worker")]
    Worker(worker::WorkerArgs),

    /// Publish benchmark jobs to the work topic
    #[command(name = "submit")]
    Submit(submit::SubmitArgs),

    /// List job nodes and their state
    #[command(name = "status")]
    Status(status::StatusArgs),

    /// Run an in-process fleet against in-memory services
    #[command(name = "demo")]
    Demo(demo::DemoArgs),
}

/// Parses the command line and runs the selected command
///
/// # Errors
///
/// Returns an error if configuration fails to load or the command fails.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    init_logging(config.log_level());
    info!(version = benchq_core::VERSION, "benchq starting");

    match cli.command {
        Commands::Worker(args) => worker::run_worker(config, args).await,
        Commands::Submit(args) => submit::run_submit(&config, &args).await,
        Commands::Status(args) => status::run_status(&config, &args).await,
        Commands::Demo(args) => demo::run(&config, &args).await,
    }
}

/// Flips to `true` on Ctrl-C
pub(crate) fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(e) => warn!(error = %e, "cannot listen for Ctrl-C"),
        }
        let _ = tx.send(true);
    });
    rx
}

/// Resolves once `signal` turns `true`
pub(crate) fn stopped(mut signal: watch::Receiver<bool>) -> impl Future<Output = ()> + Send {
    async move {
        let _ = signal.wait_for(|stop| *stop).await;
    }
}
