//! `benchq submit`

use anyhow::{Context, Result};
use benchq_core::{Config, Hardware, JobDescriptor};
use benchq_queue::{Envelope, Producer};
use clap::Args;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tracing::{debug, info};

use crate::backend;

/// Seed of the delay generator unless one is given
pub const DEFAULT_SEED: u64 = 1_582_221_789_833_178_776;

/// Arguments of `benchq submit`
#[derive(Args, Debug)]
pub struct SubmitArgs {
    /// Number of jobs to publish
    #[arg(short = 'n', long, default_value_t = 10)]
    pub count: usize,

    /// Dataset name each job trains on
    #[arg(long, default_value = "higgs1m")]
    pub dataset: String,

    /// Hardware target
    #[arg(long, default_value_t = Hardware::Cpu)]
    pub hw: Hardware,

    /// Thread-count hint; defaults to OMP_NUM_THREADS
    #[arg(long)]
    pub threads: Option<u32>,

    /// Mean of the Poisson-distributed delay between jobs, in seconds
    #[arg(long, conflicts_with = "interval_ms")]
    pub lambda: Option<f64>,

    /// Fixed delay between jobs, in milliseconds
    #[arg(long, default_value_t = 500)]
    pub interval_ms: u64,

    /// Seed for the Poisson delays
    #[arg(long, default_value_t = DEFAULT_SEED)]
    pub seed: u64,
}

/// Delay before each published job
#[derive(Debug)]
pub enum Pacing {
    /// Same delay every time
    Fixed(Duration),
    /// Whole seconds drawn from a Poisson distribution
    Poisson {
        /// Mean delay in seconds
        lambda: f64,
        /// Generator
        rng: StdRng,
    },
}

impl Pacing {
    /// Pacing described by the arguments
    #[must_use]
    pub fn from_args(args: &SubmitArgs) -> Self {
        match args.lambda {
            Some(lambda) => Self::Poisson {
                lambda,
                rng: StdRng::seed_from_u64(args.seed),
            },
            None => Self::Fixed(Duration::from_millis(args.interval_ms)),
        }
    }

    /// The next delay
    pub fn next_delay(&mut self) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Poisson { lambda, rng } => Duration::from_secs(poisson(*lambda, rng)),
        }
    }
}

// Knuth's method; fine for the small means used as inter-arrival times.
fn poisson(lambda: f64, rng: &mut impl Rng) -> u64 {
    if lambda <= 0.0 || !lambda.is_finite() {
        return 0;
    }
    let limit = (-lambda).exp();
    let mut k = 0;
    let mut p = 1.0;
    loop {
        p *= rng.r#gen::<f64>();
        if p <= limit {
            return k;
        }
        k += 1;
    }
}

/// What to publish
#[derive(Debug, Clone)]
pub struct JobPlan {
    /// Dataset name
    pub dataset: String,
    /// Hardware target
    pub hardware: Hardware,
    /// Thread-count hint
    pub threads: u32,
}

impl JobPlan {
    /// Job number `seq`, identified by the current time and the sequence
    ///
    /// # Errors
    ///
    /// Returns an error if the dataset name yields no valid job key.
    pub fn job(&self, seq: usize) -> Result<JobDescriptor> {
        let id = format!("{}_{seq}/{}", chrono::Utc::now().timestamp(), self.dataset);
        JobDescriptor::new(id, self.dataset.clone(), self.hardware, self.threads)
            .context("building job descriptor")
    }
}

/// Publishes `count` jobs to `topic`, sleeping before each one
///
/// Every message is keyed by its sequence number.
///
/// # Errors
///
/// Returns an error on the first job that cannot be built or published.
pub async fn publish_jobs(
    producer: &dyn Producer,
    topic: &str,
    plan: &JobPlan,
    count: usize,
    pacing: &mut Pacing,
) -> Result<Vec<JobDescriptor>> {
    let mut published = Vec::with_capacity(count);
    for seq in 0..count {
        let delay = pacing.next_delay();
        if !delay.is_zero() {
            debug!(seq, ?delay, "waiting before next job");
            tokio::time::sleep(delay).await;
        }

        let job = plan.job(seq)?;
        let envelope = Envelope::new(job.encode()?).with_key(seq.to_string());
        producer
            .send(topic, envelope)
            .await
            .with_context(|| format!("publishing job {seq} to {topic}"))?;
        info!(seq, key = %job.key(), topic, "job published");
        published.push(job);
    }
    producer.flush().await.context("flushing producer")?;
    Ok(published)
}

/// Runs `benchq submit`
///
/// # Errors
///
/// Returns an error if the queue is unreachable or a publish fails.
pub async fn run_submit(config: &Config, args: &SubmitArgs) -> Result<()> {
    let producer = backend::producer(&config.queue)?;
    let plan = JobPlan {
        dataset: args.dataset.clone(),
        hardware: args.hw,
        threads: args.threads.unwrap_or(config.worker.threads),
    };
    let mut pacing = Pacing::from_args(args);
    info!(count = args.count, ?pacing, topic = %config.queue.work_topic, "submitting jobs");

    let jobs = publish_jobs(
        producer.as_ref(),
        &config.queue.work_topic,
        &plan,
        args.count,
        &mut pacing,
    )
    .await?;
    producer.close().await.context("closing producer")?;
    println!("published {} jobs to {}", jobs.len(), config.queue.work_topic);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use benchq_queue::MemoryBroker;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_poisson_mean() {
        let mut rng = StdRng::seed_from_u64(DEFAULT_SEED);
        let samples = 20_000;
        let total: u64 = (0..samples).map(|_| poisson(3.0, &mut rng)).sum();
        let mean = total as f64 / f64::from(samples);
        assert!((mean - 3.0).abs() < 0.1, "mean was {mean}");
    }

    #[test]
    fn test_poisson_degenerate_lambda() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(poisson(0.0, &mut rng), 0);
        assert_eq!(poisson(f64::NAN, &mut rng), 0);
    }

    #[test]
    fn test_job_identifier_format() {
        let plan = JobPlan {
            dataset: "airline".into(),
            hardware: Hardware::Cpu,
            threads: 4,
        };
        let job = plan.job(7).unwrap();
        let (stamp, rest) = job.dataset.split_once('_').unwrap();
        assert!(stamp.parse::<i64>().is_ok());
        assert_eq!(rest, "7/airline");
        assert_eq!(job.data, "airline");
        assert_eq!(job.key().as_str(), format!("{stamp}_7_airline"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_jobs_keys_and_pacing() {
        let broker = MemoryBroker::new();
        broker.create_topic("work", 2);
        let producer = broker.producer();
        let plan = JobPlan {
            dataset: "higgs1m".into(),
            hardware: Hardware::Gpu,
            threads: 2,
        };

        let start = tokio::time::Instant::now();
        let mut pacing = Pacing::Fixed(Duration::from_millis(500));
        let jobs = publish_jobs(&producer, "work", &plan, 3, &mut pacing)
            .await
            .unwrap();

        assert_eq!(start.elapsed(), Duration::from_millis(1500));
        assert_eq!(jobs.len(), 3);
        let mut keys: Vec<String> = broker
            .published("work")
            .iter()
            .filter_map(benchq_queue::Message::key_str)
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["0", "1", "2"]);
        let decoded = JobDescriptor::decode(&broker.published("work")[0].payload).unwrap();
        assert_eq!(decoded.hardware, Hardware::Gpu);
    }
}
