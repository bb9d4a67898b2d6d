//! The worker loop.

use benchq_coord::{GuardResult, JobGuard, JobLease, StartOutcome};
use benchq_core::{CompletionEvent, Config, JobDescriptor, JobKey, WorkerSettings};
use benchq_queue::{Consumer, Envelope, Message, Producer};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::{JobRunner, StatsSnapshot, WorkerResult, WorkerStats};

/// Why a message was skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The job's `complete` marker exists
    AlreadyComplete,
    /// Another worker holds the job's lock
    LockHeldByOther,
}

/// What happened to one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Executed, marked complete and reported
    Completed {
        /// Job key
        key: JobKey,
        /// Execution time
        duration: Duration,
    },
    /// Not executed by this worker
    Skipped {
        /// Job key
        key: JobKey,
        /// Why
        reason: SkipReason,
    },
    /// Lock taken but the job did not finish; the job stays eligible
    Aborted {
        /// Job key
        key: JobKey,
        /// Failure detail
        reason: String,
    },
    /// The message is not a valid job
    Rejected {
        /// Decode failure
        reason: String,
    },
}

impl JobOutcome {
    /// The job key, unless the message was rejected
    #[must_use]
    pub fn key(&self) -> Option<&JobKey> {
        match self {
            Self::Completed { key, .. }
            | Self::Skipped { key, .. }
            | Self::Aborted { key, .. } => Some(key),
            Self::Rejected { .. } => None,
        }
    }
}

/// Consumes the work topic and executes each distinct job once
pub struct Worker {
    settings: WorkerSettings,
    work_topic: String,
    done_topic: String,
    poll_timeout: Duration,
    guard: Arc<JobGuard>,
    consumer: Arc<dyn Consumer>,
    producer: Arc<dyn Producer>,
    runner: Arc<dyn JobRunner>,
    stats: WorkerStats,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("pod", &self.settings.pod_id)
            .field("work_topic", &self.work_topic)
            .field("done_topic", &self.done_topic)
            .field("guard", &self.guard)
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Creates a worker
    #[must_use]
    pub fn new(
        config: &Config,
        guard: Arc<JobGuard>,
        consumer: Arc<dyn Consumer>,
        producer: Arc<dyn Producer>,
        runner: Arc<dyn JobRunner>,
    ) -> Self {
        Self {
            settings: config.worker.clone(),
            work_topic: config.queue.work_topic.clone(),
            done_topic: config.queue.done_topic.clone(),
            poll_timeout: config.queue.poll_timeout(),
            guard,
            consumer,
            producer,
            runner,
            stats: WorkerStats::new(),
        }
    }

    /// Shared handle on this worker's counters
    #[must_use]
    pub fn stats(&self) -> WorkerStats {
        self.stats.clone()
    }

    /// Pod id reported in completion events
    #[must_use]
    pub fn pod_id(&self) -> &str {
        &self.settings.pod_id
    }

    /// Runs the loop until the process ends
    ///
    /// # Errors
    ///
    /// Returns an error if the coordination session is lost.
    pub async fn run(&self) -> WorkerResult<StatsSnapshot> {
        self.run_until(std::future::pending()).await
    }

    /// Runs the loop until `shutdown` resolves
    ///
    /// A job in progress is finished before the loop observes the shutdown.
    /// Queue errors are logged and followed by a backoff and a fresh
    /// subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordination session is lost or closed; the
    /// caller has to build a new guard to continue.
    pub async fn run_until<F>(&self, shutdown: F) -> WorkerResult<StatsSnapshot>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        let backoff = self.settings.resubscribe_backoff();
        info!(pod = %self.settings.pod_id, topic = %self.work_topic, "worker starting");

        'subscribe: loop {
            let subscribed = tokio::select! {
                biased;
                () = &mut shutdown => break 'subscribe,
                r = self.consumer.messages(&self.work_topic, Some(self.poll_timeout)) => r,
            };
            let mut stream = match subscribed {
                Ok(stream) => stream,
                Err(e) => {
                    error!(topic = %self.work_topic, error = %e, "subscribe failed");
                    if self.pause(backoff, &mut shutdown).await {
                        break 'subscribe;
                    }
                    continue 'subscribe;
                }
            };

            loop {
                let polled = tokio::select! {
                    biased;
                    () = &mut shutdown => break 'subscribe,
                    r = stream.next_batch() => r,
                };
                let batch = match polled {
                    Ok(batch) => batch,
                    Err(e) => {
                        error!(topic = %self.work_topic, error = %e, "poll failed");
                        if self.pause(backoff, &mut shutdown).await {
                            break 'subscribe;
                        }
                        continue 'subscribe;
                    }
                };
                if batch.timed_out {
                    trace!(topic = %self.work_topic, "no messages");
                    continue;
                }
                for message in &batch.messages {
                    self.process_message(message).await?;
                }
            }
        }

        let stats = self.stats.snapshot();
        info!(pod = %self.settings.pod_id, ?stats, "worker stopped");
        Ok(stats)
    }

    // Sleeps for `backoff`; true if shutdown fired first.
    async fn pause<F>(&self, backoff: Duration, shutdown: &mut std::pin::Pin<&mut F>) -> bool
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            () = shutdown.as_mut() => true,
            () = tokio::time::sleep(backoff) => false,
        }
    }

    /// Handles one work-topic message
    ///
    /// The message has already been consumed, so while coordination is
    /// unreachable the same job is retried after each backoff rather than
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns an error only if the coordination session is gone. Every other
    /// failure is folded into the returned outcome.
    pub async fn process_message(&self, message: &Message) -> WorkerResult<JobOutcome> {
        let outcome = match JobDescriptor::decode(&message.payload) {
            Ok(job) => self.process_job(&job).await?,
            Err(e) => {
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "rejecting malformed job message"
                );
                JobOutcome::Rejected {
                    reason: e.to_string(),
                }
            }
        };
        self.stats.record(&outcome);
        Ok(outcome)
    }

    async fn process_job(&self, job: &JobDescriptor) -> WorkerResult<JobOutcome> {
        let key = job.key();
        let guard = &self.guard;

        if self.coordinate(key, "processed", || guard.processed(key)).await? {
            debug!(key = %key, "already processed");
            return Ok(skipped(key, SkipReason::AlreadyComplete));
        }

        let lease = match self.coordinate(key, "start", || guard.start(key)).await? {
            StartOutcome::Granted(lease) => lease,
            StartOutcome::AlreadyComplete => {
                return Ok(skipped(key, SkipReason::AlreadyComplete));
            }
            StartOutcome::LockHeldByOther => {
                debug!(key = %key, "locked by another worker");
                return Ok(skipped(key, SkipReason::LockHeldByOther));
            }
        };

        info!(
            key = %key,
            pod = %self.settings.pod_id,
            data = %job.data,
            hw = %job.hardware,
            threads = self.settings.threads,
            ompcpus = job.threads,
            "running job"
        );
        let started = Instant::now();
        if let Err(e) = self.runner.run(job).await {
            error!(key = %key, error = %e, "job failed");
            self.release(&lease).await?;
            return Ok(JobOutcome::Aborted {
                key: key.clone(),
                reason: e.to_string(),
            });
        }
        let duration = started.elapsed();

        if let Err(e) = self.finish(&lease).await {
            error!(key = %key, error = %e, "could not record completion");
            self.release(&lease).await?;
            return Ok(JobOutcome::Aborted {
                key: key.clone(),
                reason: format!("completion not recorded: {e}"),
            });
        }

        self.report(CompletionEvent::new(
            key.clone(),
            duration,
            self.settings.pod_id.clone(),
        ))
        .await;
        info!(key = %key, pod = %self.settings.pod_id, duration = ?duration, "job complete");
        Ok(JobOutcome::Completed {
            key: key.clone(),
            duration,
        })
    }

    // `end` with bounded retries on transient failures.
    async fn finish(&self, lease: &JobLease) -> WorkerResult {
        let backoff = self.settings.resubscribe_backoff();
        let mut attempt = 0;
        loop {
            match self.guard.end(lease).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.settings.end_retries => {
                    attempt += 1;
                    warn!(key = %lease.key(), attempt, error = %e, "retrying completion");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // Aborts the lease. The session outlives a transient failure and so
    // would the lock, so this keeps trying until the service answers.
    async fn release(&self, lease: &JobLease) -> WorkerResult {
        let guard = &self.guard;
        self.coordinate(lease.key(), "abort", || guard.abort(lease)).await
    }

    // Repeats a guard call after the backoff while it fails transiently.
    async fn coordinate<T, F, Fut>(&self, key: &JobKey, step: &str, mut call: F) -> WorkerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GuardResult<T>>,
    {
        let backoff = self.settings.resubscribe_backoff();
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    self.stats.record_coordination_retry();
                    warn!(key = %key, step, error = %e, "coordination unavailable; retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    error!(key = %key, step, error = %e, "coordination session lost");
                    return Err(e.into());
                }
            }
        }
    }

    async fn report(&self, event: CompletionEvent) {
        let payload = match event.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!(key = %event.key, error = %e, "could not encode completion event");
                self.stats.record_publish_failure();
                return;
            }
        };
        let envelope = Envelope::new(payload)
            .with_key(event.key.as_str())
            .with_partition(0);
        if let Err(e) = self.producer.send(&self.done_topic, envelope).await {
            error!(key = %event.key, topic = %self.done_topic, error = %e, "completion event not published");
            self.stats.record_publish_failure();
        }
    }

    /// Flushes the producer and ends the coordination session
    ///
    /// # Errors
    ///
    /// Returns the first error encountered; both steps are always attempted.
    pub async fn close(&self) -> WorkerResult {
        let flushed = self.producer.close().await;
        let closed = self.guard.close().await;
        flushed?;
        closed?;
        Ok(())
    }
}

fn skipped(key: &JobKey, reason: SkipReason) -> JobOutcome {
    JobOutcome::Skipped {
        key: key.clone(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use benchq_coord::MemoryEnsemble;
    use benchq_core::Hardware;
    use benchq_queue::MemoryBroker;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    struct Succeed;

    #[async_trait]
    impl JobRunner for Succeed {
        async fn run(&self, _job: &JobDescriptor) -> WorkerResult {
            Ok(())
        }
    }

    struct Fail;

    #[async_trait]
    impl JobRunner for Fail {
        async fn run(&self, _job: &JobDescriptor) -> WorkerResult {
            Err(crate::WorkerError::execution("exit status 1"))
        }
    }

    async fn worker(
        ensemble: &MemoryEnsemble,
        broker: &MemoryBroker,
        runner: Arc<dyn JobRunner>,
    ) -> Worker {
        let config = Config::default();
        broker.create_topic(&config.queue.work_topic, 1);
        broker.create_topic(&config.queue.done_topic, 1);
        let guard = JobGuard::connect(Arc::new(ensemble.connect()), &config.coordination.root)
            .await
            .unwrap();
        Worker::new(
            &config,
            Arc::new(guard),
            Arc::new(broker.consumer(&config.queue.group)),
            Arc::new(broker.producer()),
            runner,
        )
    }

    fn message(payload: &[u8]) -> Message {
        Message {
            topic: "ktopic-xgboost".into(),
            partition: 0,
            offset: 0,
            key: None,
            payload: payload.to_vec(),
        }
    }

    fn job_message(dataset: &str) -> Message {
        let job = JobDescriptor::new(dataset, "higgs1m", Hardware::Cpu, 4).unwrap();
        message(&job.encode().unwrap())
    }

    #[tokio::test]
    async fn test_completed_job_publishes_event() {
        let ensemble = MemoryEnsemble::new();
        let broker = MemoryBroker::new();
        let worker = worker(&ensemble, &broker, Arc::new(Succeed)).await;

        let outcome = worker.process_message(&job_message("1_0/higgs1m")).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Completed { .. }));

        let done = broker.published("ktopic-xgboost-done");
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].partition, 0);
        let event = CompletionEvent::decode(&done[0].payload).unwrap();
        assert_eq!(event.key.as_str(), "1_0_higgs1m");
        assert_eq!(event.pod_id, "0");
        assert!(ensemble.contains("/benchq/jobs/1_0_higgs1m/complete"));
        assert!(!ensemble.contains("/benchq/jobs/1_0_higgs1m/processing"));
    }

    #[tokio::test]
    async fn test_failed_job_is_aborted() {
        let ensemble = MemoryEnsemble::new();
        let broker = MemoryBroker::new();
        let worker = worker(&ensemble, &broker, Arc::new(Fail)).await;

        let outcome = worker.process_message(&job_message("1_1/higgs1m")).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Aborted { .. }));
        assert!(broker.published("ktopic-xgboost-done").is_empty());
        assert!(!ensemble.contains("/benchq/jobs/1_1_higgs1m/complete"));
        assert!(!ensemble.contains("/benchq/jobs/1_1_higgs1m/processing"));
        assert_eq!(worker.stats().snapshot().aborted, 1);
    }

    #[rstest]
    #[case::not_json(b"not json".as_slice())]
    #[case::missing_dataset(br#"{"hw":"cpu","data":"x","ompcpus":"1"}"#.as_slice())]
    #[case::zero_threads(br#"{"dataset":"1/x","hw":"cpu","data":"x","ompcpus":"0"}"#.as_slice())]
    #[tokio::test]
    async fn test_malformed_messages_are_rejected(#[case] payload: &[u8]) {
        let ensemble = MemoryEnsemble::new();
        let broker = MemoryBroker::new();
        let worker = worker(&ensemble, &broker, Arc::new(Succeed)).await;

        let outcome = worker.process_message(&message(payload)).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Rejected { .. }));
        assert_eq!(outcome.key(), None);
        assert_eq!(worker.stats().snapshot().rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumed_job_survives_coordination_outage() {
        let ensemble = MemoryEnsemble::new();
        let broker = MemoryBroker::new();
        let worker = Arc::new(worker(&ensemble, &broker, Arc::new(Succeed)).await);
        let config = Config::default();

        let running = Arc::clone(&worker);
        let handle = tokio::spawn(async move { running.run().await });

        ensemble.set_available(false);
        let job = JobDescriptor::new("1_2/higgs1m", "higgs1m", Hardware::Cpu, 4).unwrap();
        broker
            .producer()
            .send(&config.queue.work_topic, Envelope::new(job.encode().unwrap()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(broker.lag(&config.queue.group, &config.queue.work_topic), 0);
        assert!(worker.stats().snapshot().coordination_retries > 0);
        assert!(worker.stats().completed_jobs().is_empty());

        ensemble.set_available(true);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(ensemble.contains("/benchq/jobs/1_2_higgs1m/complete"));
        assert_eq!(worker.stats().snapshot().completed, 1);
        assert_eq!(broker.published(&config.queue.done_topic).len(), 1);
        handle.abort();
    }

    /// Fails the job and takes coordination down while the lock is released
    struct FailDuringOutage {
        ensemble: MemoryEnsemble,
    }

    #[async_trait]
    impl JobRunner for FailDuringOutage {
        async fn run(&self, _job: &JobDescriptor) -> WorkerResult {
            self.ensemble.set_available(false);
            let ensemble = self.ensemble.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                ensemble.set_available(true);
            });
            Err(crate::WorkerError::execution("exit status 1"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_outlasts_coordination_outage() {
        let ensemble = MemoryEnsemble::new();
        let broker = MemoryBroker::new();
        let runner = Arc::new(FailDuringOutage {
            ensemble: ensemble.clone(),
        });
        let worker = worker(&ensemble, &broker, runner).await;

        let outcome = worker.process_message(&job_message("1_4/higgs1m")).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Aborted { .. }));
        assert!(!ensemble.contains("/benchq/jobs/1_4_higgs1m/processing"));
        assert!(worker.stats().snapshot().coordination_retries > 0);

        let other = JobGuard::connect(Arc::new(ensemble.connect()), "/benchq/jobs")
            .await
            .unwrap();
        let key = JobKey::from_dataset("1_4/higgs1m").unwrap();
        assert!(other.start(&key).await.unwrap().is_granted());
    }

    #[tokio::test]
    async fn test_lost_session_is_fatal() {
        let ensemble = MemoryEnsemble::new();
        let broker = MemoryBroker::new();
        let worker = worker(&ensemble, &broker, Arc::new(Succeed)).await;

        worker.guard.close().await.unwrap();
        let err = worker
            .process_message(&job_message("1_3/higgs1m"))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
