//! Job descriptors, job keys and completion events.
//!
//! These are the payloads exchanged over the work and done topics. Both are
//! JSON text; decoding validates them so that a malformed message is rejected
//! up front instead of failing deep inside a benchmark run.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::{CoreError, CoreErrorKind, CoreResult};

/// Identifier of one unit of work.
///
/// Derived from the dataset identifier of a job message and used verbatim as
/// a node name in the coordination namespace, so it never contains `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKey(String);

impl JobKey {
    /// Derives a job key from a dataset identifier
    ///
    /// `/` and characters a coordination node name cannot hold are replaced
    /// with `_`.
    ///
    /// # Errors
    ///
    /// Returns an error if the normalized key is empty, `.` or `..`.
    pub fn from_dataset(dataset: &str) -> CoreResult<Self> {
        let normalized: String = dataset
            .chars()
            .map(|c| if c == '/' || c.is_control() { '_' } else { c })
            .collect();

        let reason = match normalized.as_str() {
            "" => Some("empty after normalization"),
            "." | ".." => Some("reserved path segment"),
            _ => None,
        };
        if let Some(reason) = reason {
            return Err(CoreErrorKind::InvalidJobKey {
                raw: dataset.to_string(),
                reason,
            }
            .into());
        }

        Ok(Self(normalized))
    }

    /// Returns the key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for JobKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Hardware target of a benchmark run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Hardware {
    /// CPU training
    #[default]
    Cpu,
    /// GPU training
    Gpu,
}

impl fmt::Display for Hardware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Gpu => f.write_str("gpu"),
        }
    }
}

impl std::str::FromStr for Hardware {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "gpu" => Ok(Self::Gpu),
            other => Err(CoreError::config(format!("unknown hardware target '{other}'"))),
        }
    }
}

/// A job read from the work topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireJob", into = "WireJob")]
pub struct JobDescriptor {
    /// Unique dataset identifier, e.g. `1700000000_3/higgs1m`
    pub dataset: String,
    /// Hardware target
    pub hardware: Hardware,
    /// Name of the dataset to train on
    pub data: String,
    /// Thread-count hint for the run
    pub threads: u32,
    key: JobKey,
}

impl JobDescriptor {
    /// Creates a job descriptor
    ///
    /// # Errors
    ///
    /// Returns an error if `dataset` does not yield a valid job key.
    pub fn new(
        dataset: impl Into<String>,
        data: impl Into<String>,
        hardware: Hardware,
        threads: u32,
    ) -> CoreResult<Self> {
        let dataset = dataset.into();
        let key = JobKey::from_dataset(&dataset)?;
        Ok(Self {
            dataset,
            hardware,
            data: data.into(),
            threads,
            key,
        })
    }

    /// Decodes and validates a job message payload
    ///
    /// # Errors
    ///
    /// Returns a malformed-message error if the payload is not valid JSON or
    /// violates the schema.
    pub fn decode(payload: &[u8]) -> CoreResult<Self> {
        serde_json::from_slice(payload).map_err(|e| CoreError::malformed(e.to_string()))
    }

    /// Encodes the descriptor in its wire format
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| CoreError::malformed(e.to_string()))
    }

    /// The job key derived from the dataset identifier
    #[must_use]
    pub fn key(&self) -> &JobKey {
        &self.key
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireJob {
    dataset: String,
    #[serde(default)]
    hw: Hardware,
    data: String,
    ompcpus: ThreadHint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum ThreadHint {
    Number(u64),
    Text(String),
}

impl TryFrom<WireJob> for JobDescriptor {
    type Error = CoreError;

    fn try_from(wire: WireJob) -> Result<Self, Self::Error> {
        if wire.dataset.trim().is_empty() {
            return Err(CoreError::malformed("field 'dataset' is empty"));
        }
        if wire.data.trim().is_empty() {
            return Err(CoreError::malformed("field 'data' is empty"));
        }

        let threads = match wire.ompcpus {
            ThreadHint::Number(n) => u32::try_from(n).ok(),
            ThreadHint::Text(s) => s.trim().parse::<u32>().ok(),
        }
        .filter(|n| *n > 0)
        .ok_or_else(|| CoreError::malformed("field 'ompcpus' is not a positive integer"))?;

        Self::new(wire.dataset, wire.data, wire.hw, threads)
    }
}

impl From<JobDescriptor> for WireJob {
    fn from(job: JobDescriptor) -> Self {
        Self {
            dataset: job.dataset,
            hw: job.hardware,
            data: job.data,
            ompcpus: ThreadHint::Text(job.threads.to_string()),
        }
    }
}

/// Record published to the done topic after a job completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireCompletion", into = "WireCompletion")]
pub struct CompletionEvent {
    /// Key of the completed job
    pub key: JobKey,
    /// Wall-clock duration of the run
    pub duration: Duration,
    /// Identifier of the worker that ran the job
    pub pod_id: String,
}

impl CompletionEvent {
    /// Creates a completion event
    #[must_use]
    pub fn new(key: JobKey, duration: Duration, pod_id: impl Into<String>) -> Self {
        Self {
            key,
            duration,
            pod_id: pod_id.into(),
        }
    }

    /// Encodes the event in its wire format
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| CoreError::malformed(e.to_string()))
    }

    /// Decodes a completion event payload
    ///
    /// # Errors
    ///
    /// Returns a malformed-message error if the payload does not match the
    /// schema.
    pub fn decode(payload: &[u8]) -> CoreResult<Self> {
        serde_json::from_slice(payload).map_err(|e| CoreError::malformed(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireCompletion {
    key: String,
    duration: String,
    #[serde(rename = "PodID")]
    pod_id: String,
}

impl TryFrom<WireCompletion> for CompletionEvent {
    type Error = CoreError;

    fn try_from(wire: WireCompletion) -> Result<Self, Self::Error> {
        let secs: f64 = wire
            .duration
            .trim()
            .parse()
            .map_err(|_| CoreError::malformed("field 'duration' is not a number"))?;
        let duration = Duration::try_from_secs_f64(secs)
            .map_err(|_| CoreError::malformed("field 'duration' is out of range"))?;

        Ok(Self {
            key: JobKey::from_dataset(&wire.key)?,
            duration,
            pod_id: wire.pod_id,
        })
    }
}

impl From<CompletionEvent> for WireCompletion {
    fn from(event: CompletionEvent) -> Self {
        Self {
            key: event.key.0,
            duration: format!("{:.2}", event.duration.as_secs_f64()),
            pod_id: event.pod_id,
        }
    }
}
