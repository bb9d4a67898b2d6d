//! Configuration management
//!
//! A [`Config`] is built once at process start and handed by reference to
//! the worker, the job guard and the queue clients. Values are layered:
//! defaults, then an optional YAML file, then environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{CoreError, CoreResult};

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Coordination service settings
    pub coordination: CoordinationConfig,
    /// Message queue settings
    pub queue: QueueConfig,
    /// Worker loop settings
    pub worker: WorkerSettings,
    /// Log level used when `RUST_LOG` is not set
    pub log_level: String,
}

/// Coordination service settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Connect string, e.g. `zookeeper:2181`
    pub hosts: String,
    /// Session timeout in seconds
    pub session_timeout_secs: u64,
    /// Namespace root under which job nodes are created
    pub root: String,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            hosts: "zookeeper:2181".to_string(),
            session_timeout_secs: 30,
            root: "/benchq/jobs".to_string(),
        }
    }
}

impl CoordinationConfig {
    /// Session timeout as a duration
    #[must_use]
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

/// Message queue settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Bootstrap brokers, comma separated
    pub brokers: String,
    /// Topic jobs are consumed from
    pub work_topic: String,
    /// Topic completion events are published to
    pub done_topic: String,
    /// Consumer group shared by all workers
    pub group: String,
    /// Client identifier reported to the brokers
    pub client_id: String,
    /// Poll timeout in milliseconds
    pub poll_timeout_ms: u64,
    /// Upper bound on messages returned by one poll
    pub max_batch: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            brokers: "broker:9092".to_string(),
            work_topic: "ktopic-xgboost".to_string(),
            done_topic: "ktopic-xgboost-done".to_string(),
            group: "kgroup-xgboost".to_string(),
            client_id: std::env::var("HOSTNAME").unwrap_or_else(|_| "benchq".to_string()),
            poll_timeout_ms: 100,
            max_batch: 64,
        }
    }
}

impl QueueConfig {
    /// Poll timeout as a duration
    #[must_use]
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Worker loop settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Pod identifier reported in completion events
    pub pod_id: String,
    /// Threads the benchmark may use, exported to it as `OMP_NUM_THREADS`
    pub threads: u32,
    /// Pause before re-subscribing after a queue error, in milliseconds
    pub resubscribe_backoff_ms: u64,
    /// Attempts made to record completion before giving the job back
    pub end_retries: u32,
    /// Benchmark program spawned for each job
    pub runner_program: String,
    /// Argument templates for the benchmark program
    pub runner_args: Vec<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            pod_id: "0".to_string(),
            threads: 1,
            resubscribe_backoff_ms: 2000,
            end_retries: 3,
            runner_program: "xgboost-bench".to_string(),
            runner_args: vec![
                "--dataset".to_string(),
                "{data}".to_string(),
                "--hw".to_string(),
                "{hw}".to_string(),
            ],
        }
    }
}

impl WorkerSettings {
    /// Re-subscribe backoff as a duration
    #[must_use]
    pub fn resubscribe_backoff(&self) -> Duration {
        Duration::from_millis(self.resubscribe_backoff_ms)
    }
}

impl Config {
    /// Builds the configuration from defaults and the process environment
    ///
    /// # Errors
    ///
    /// Returns an error if an environment variable holds an unparsable value
    /// or the result fails validation.
    pub fn from_env() -> CoreResult<Self> {
        Self::load(None)
    }

    /// Builds the configuration from defaults, an optional YAML file and the
    /// process environment, in that order
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, an environment
    /// variable is invalid, or the result fails validation.
    pub fn load(path: Option<&Path>) -> CoreResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&content)
            .map_err(|e| CoreError::config(format!("{}: {e}", path.display())))
    }

    /// Overlays values from an environment lookup
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric variable does not parse.
    pub fn apply_env<F>(&mut self, lookup: F) -> CoreResult
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("BENCHQ_ZK_HOSTS") {
            self.coordination.hosts = v;
        }
        if let Some(v) = var("BENCHQ_ZK_SESSION_TIMEOUT_SECS") {
            self.coordination.session_timeout_secs = parse_number("BENCHQ_ZK_SESSION_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("BENCHQ_ZK_ROOT") {
            self.coordination.root = v;
        }

        if let Some(v) = var("BENCHQ_BROKERS") {
            self.queue.brokers = v;
        }
        if let Some(v) = var("BENCHQ_WORK_TOPIC") {
            self.queue.work_topic = v;
        }
        if let Some(v) = var("BENCHQ_DONE_TOPIC") {
            self.queue.done_topic = v;
        }
        if let Some(v) = var("BENCHQ_GROUP") {
            self.queue.group = v;
        }
        if let Some(v) = var("BENCHQ_CLIENT_ID") {
            self.queue.client_id = v;
        }
        if let Some(v) = var("BENCHQ_POLL_TIMEOUT_MS") {
            self.queue.poll_timeout_ms = parse_number("BENCHQ_POLL_TIMEOUT_MS", &v)?;
        }

        if let Some(v) = var("POD_ID") {
            self.worker.pod_id = v;
        }
        if let Some(v) = var("OMP_NUM_THREADS") {
            self.worker.threads = parse_number("OMP_NUM_THREADS", &v)?;
        }
        if let Some(v) = var("BENCHQ_RESUBSCRIBE_BACKOFF_MS") {
            self.worker.resubscribe_backoff_ms = parse_number("BENCHQ_RESUBSCRIBE_BACKOFF_MS", &v)?;
        }
        if let Some(v) = var("BENCHQ_END_RETRIES") {
            self.worker.end_retries = parse_number("BENCHQ_END_RETRIES", &v)?;
        }
        if let Some(v) = var("BENCHQ_RUNNER_PROGRAM") {
            self.worker.runner_program = v;
        }
        if let Some(v) = var("BENCHQ_RUNNER_ARGS") {
            self.worker.runner_args = shell_words::split(&v)
                .map_err(|e| CoreError::config(format!("BENCHQ_RUNNER_ARGS: {e}")))?;
        }

        if let Some(v) = var("BENCHQ_LOG") {
            self.log_level = v;
        }

        Ok(())
    }

    /// Checks the invariants the rest of the system relies on
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first violation found.
    pub fn validate(&self) -> CoreResult {
        let root = &self.coordination.root;
        if !root.starts_with('/') || (root.len() > 1 && root.ends_with('/')) {
            return Err(CoreError::config(format!(
                "coordination root '{root}' must be absolute without a trailing slash"
            )));
        }
        if self.coordination.session_timeout_secs == 0 {
            return Err(CoreError::config("session timeout must be positive"));
        }
        if self.queue.work_topic.is_empty() || self.queue.done_topic.is_empty() {
            return Err(CoreError::config("topic names must not be empty"));
        }
        if self.queue.work_topic == self.queue.done_topic {
            return Err(CoreError::config("work and done topics must differ"));
        }
        if self.queue.group.is_empty() {
            return Err(CoreError::config("consumer group must not be empty"));
        }
        if self.queue.max_batch == 0 {
            return Err(CoreError::config("max batch must be positive"));
        }
        if self.worker.pod_id.is_empty() {
            return Err(CoreError::config("pod id must not be empty"));
        }
        if self.worker.threads == 0 {
            return Err(CoreError::config("thread hint must be positive"));
        }
        if self.worker.runner_program.is_empty() {
            return Err(CoreError::config("runner program must not be empty"));
        }
        Ok(())
    }

    /// Effective log level
    #[must_use]
    pub fn log_level(&self) -> &str {
        if self.log_level.is_empty() {
            "info"
        } else {
            &self.log_level
        }
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> CoreResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| CoreError::config(format!("{name}: '{value}' is not a valid number")))
}
