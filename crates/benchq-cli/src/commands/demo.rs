//! `benchq demo`
//!
//! Runs a small fleet in one process against the in-memory coordination
//! ensemble and broker. Duplicate submissions and a configurable failure
//! rate exercise the same paths a real deployment hits; whenever the work
//! topic drains with jobs still incomplete, the group's offsets are rewound
//! so the remaining jobs get redelivered.

use anyhow::{Context, Result};
use async_trait::async_trait;
use benchq_coord::{JobEntry, JobGuard, JobStatus, MemoryEnsemble};
use benchq_core::{CompletionEvent, Config, Hardware, JobDescriptor, JobKey};
use benchq_queue::{Envelope, MemoryBroker, Producer};
use benchq_worker::{JobRunner, StatsSnapshot, Worker, WorkerError, WorkerResult};
use clap::Args;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use super::stopped;
use super::submit::{DEFAULT_SEED, JobPlan, Pacing, publish_jobs};

/// Arguments of `benchq demo`
#[derive(Args, Debug, Clone)]
pub struct DemoArgs {
    /// Number of workers
    #[arg(long, default_value_t = 3)]
    pub workers: usize,

    /// Number of distinct jobs
    #[arg(long, default_value_t = 8)]
    pub jobs: usize,

    /// Extra copies of already submitted jobs
    #[arg(long, default_value_t = 3)]
    pub duplicates: usize,

    /// Partitions of the work topic
    #[arg(long, default_value_t = 3)]
    pub partitions: usize,

    /// Simulated duration of one job, in milliseconds
    #[arg(long, default_value_t = 50)]
    pub job_ms: u64,

    /// Probability that a simulated job fails
    #[arg(long, default_value_t = 0.0)]
    pub fail_rate: f64,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 60)]
    pub timeout_secs: u64,

    /// Seed for simulated failures
    #[arg(long, default_value_t = DEFAULT_SEED)]
    pub seed: u64,
}

/// Sleeps for a fixed time and fails at random
struct SimulatedRunner {
    job_time: Duration,
    fail_rate: f64,
    rng: Mutex<StdRng>,
}

#[async_trait]
impl JobRunner for SimulatedRunner {
    async fn run(&self, job: &JobDescriptor) -> WorkerResult {
        let fail = self.fail_rate > 0.0 && self.rng.lock().gen_bool(self.fail_rate.min(1.0));
        tokio::time::sleep(self.job_time).await;
        if fail {
            return Err(WorkerError::execution(format!(
                "simulated failure of {}",
                job.key()
            )));
        }
        Ok(())
    }
}

/// What a demo run produced
#[derive(Debug)]
pub struct DemoReport {
    /// Completion events read back from the done topic
    pub events: Vec<CompletionEvent>,
    /// Counters per pod
    pub stats: Vec<(String, StatsSnapshot)>,
    /// Final state of every job node
    pub inventory: Vec<JobEntry>,
    /// Number of times the work topic was replayed
    pub redeliveries: usize,
}

/// Runs the demo fleet to completion
///
/// # Errors
///
/// Returns an error if setup fails, a worker loses its session, or the jobs
/// do not all complete before the timeout.
pub async fn run_demo(config: &Config, args: &DemoArgs) -> Result<DemoReport> {
    let ensemble = MemoryEnsemble::new();
    let broker = MemoryBroker::new();
    let queue = &config.queue;
    broker.create_topic(&queue.work_topic, args.partitions.max(1));
    broker.create_topic(&queue.done_topic, 1);

    let runner: Arc<dyn JobRunner> = Arc::new(SimulatedRunner {
        job_time: Duration::from_millis(args.job_ms),
        fail_rate: args.fail_rate,
        rng: Mutex::new(StdRng::seed_from_u64(args.seed)),
    });
    let (stop, signal) = watch::channel(false);

    let mut handles = Vec::with_capacity(args.workers);
    for index in 0..args.workers.max(1) {
        let mut worker_config = config.clone();
        worker_config.worker.pod_id = format!("demo-{index}");
        worker_config.worker.resubscribe_backoff_ms = 200;
        let guard = JobGuard::connect(
            Arc::new(ensemble.connect()),
            config.coordination.root.clone(),
        )
        .await?;
        let worker = Worker::new(
            &worker_config,
            Arc::new(guard),
            Arc::new(broker.consumer(&queue.group)),
            Arc::new(broker.producer()),
            Arc::clone(&runner),
        );
        let shutdown = stopped(signal.clone());
        handles.push(tokio::spawn(async move {
            let result = worker.run_until(shutdown).await;
            (worker.pod_id().to_string(), result)
        }));
    }

    let producer = broker.producer();
    let plan = JobPlan {
        dataset: "higgs1m".into(),
        hardware: Hardware::Cpu,
        threads: config.worker.threads,
    };
    let jobs = publish_jobs(
        &producer,
        &queue.work_topic,
        &plan,
        args.jobs,
        &mut Pacing::Fixed(Duration::ZERO),
    )
    .await?;
    for (n, job) in jobs.iter().cycle().take(args.duplicates).enumerate() {
        producer
            .send(
                &queue.work_topic,
                Envelope::new(job.encode()?).with_key(format!("dup-{n}")),
            )
            .await?;
    }
    let expected: HashSet<JobKey> = jobs.iter().map(|j| j.key().clone()).collect();
    info!(jobs = expected.len(), duplicates = args.duplicates, "demo jobs submitted");

    let observer = JobGuard::connect(
        Arc::new(ensemble.connect()),
        config.coordination.root.clone(),
    )
    .await?;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.timeout_secs);
    let tick = Duration::from_millis(args.job_ms.saturating_mul(2).max(100));
    let mut redeliveries = 0;
    loop {
        let mut pending = 0;
        for key in &expected {
            if !observer.processed(key).await? {
                pending += 1;
            }
        }
        if pending == 0 {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            let _ = stop.send(true);
            anyhow::bail!("{pending} jobs still incomplete after {}s", args.timeout_secs);
        }
        if broker.lag(&queue.group, &queue.work_topic) == 0 {
            redeliveries += 1;
            warn!(pending, "work topic drained with jobs left; redelivering");
            broker.rewind(&queue.group, &queue.work_topic);
        }
        tokio::time::sleep(tick).await;
    }

    let _ = stop.send(true);
    let mut stats = Vec::with_capacity(handles.len());
    for handle in handles {
        let (pod, result) = handle.await.context("worker task panicked")?;
        stats.push((pod, result?));
    }

    let inventory = observer.inventory().await?;
    observer.close().await?;
    let events = broker
        .published(&queue.done_topic)
        .iter()
        .map(|m| CompletionEvent::decode(&m.payload))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(DemoReport {
        events,
        stats,
        inventory,
        redeliveries,
    })
}

/// Runs `benchq demo` and prints the report
///
/// # Errors
///
/// Returns any error from [`run_demo`].
pub async fn run(config: &Config, args: &DemoArgs) -> Result<()> {
    let report = run_demo(config, args).await?;

    println!("completion events:");
    for event in &report.events {
        println!(
            "  {:<28} {:>8.2}s  {}",
            event.key.as_str(),
            event.duration.as_secs_f64(),
            event.pod_id
        );
    }
    println!("workers:");
    for (pod, stats) in &report.stats {
        println!(
            "  {pod}: {} completed, {} skipped, {} aborted, {} rejected",
            stats.completed,
            stats.skipped_complete + stats.skipped_locked,
            stats.aborted,
            stats.rejected
        );
    }
    let completed = report
        .inventory
        .iter()
        .filter(|e| e.status == JobStatus::Completed)
        .count();
    println!(
        "{completed}/{} jobs complete, {} events, {} redeliveries",
        report.inventory.len(),
        report.events.len(),
        report.redeliveries
    );
    Ok(())
}
