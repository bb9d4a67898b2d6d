//! # benchq Queue
//!
//! Producer and consumer clients for the work and done topics.
//!
//! ## Architecture
//!
//! - `client`: [`Producer`], [`Consumer`] and [`Subscription`] traits, and
//!   the [`MessageStream`] returned to the worker loop
//! - `memory`: In-process broker with partitions and consumer groups
//! - `kafka`: Kafka backend (feature `kafka`)
//!
//! Delivery is at-least-once. Nothing here coordinates offsets with job
//! execution; duplicates are expected and handled by the job guard.
//!
//! ## Example
//!
//! ```rust,ignore
//! use benchq_queue::{Consumer, MemoryBroker};
//!
//! let broker = MemoryBroker::new();
//! broker.create_topic("ktopic-xgboost", 4);
//! let consumer = broker.consumer("kgroup-xgboost");
//! let mut stream = consumer.messages("ktopic-xgboost", Some(Duration::from_secs(5))).await?;
//! let batch = stream.next_batch().await?;
//! ```

#![warn(missing_docs)]
#![warn(unused)]
#![warn(clippy::pedantic)]

pub mod client;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

pub use client::{Consumer, MessageStream, Producer, Subscription};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaConsumer, KafkaProducer};
pub use memory::{MemoryBroker, MemoryConsumer, MemoryProducer};

/// A message read from a topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic the message was read from
    pub topic: String,
    /// Partition within the topic
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Optional message key
    pub key: Option<Vec<u8>>,
    /// Message payload
    pub payload: Vec<u8>,
}

impl Message {
    /// Key decoded as UTF-8, lossily
    #[must_use]
    pub fn key_str(&self) -> Option<String> {
        self.key
            .as_deref()
            .map(|k| String::from_utf8_lossy(k).into_owned())
    }
}

/// A message to publish
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    /// Optional message key
    pub key: Option<String>,
    /// Message payload
    pub payload: Vec<u8>,
    /// Target partition; the backend's partitioner decides when `None`
    pub partition: Option<i32>,
}

impl Envelope {
    /// Creates an envelope around a payload
    #[must_use]
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    /// Sets the message key
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Pins the message to a partition
    #[must_use]
    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }
}

/// Outcome of one poll
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollBatch {
    /// Messages returned by the poll, possibly none
    pub messages: Vec<Message>,
    /// True when the poll window elapsed without any message
    pub timed_out: bool,
}

impl PollBatch {
    /// An empty batch for an elapsed poll window
    #[must_use]
    pub fn timeout() -> Self {
        Self {
            messages: Vec::new(),
            timed_out: true,
        }
    }
}

/// Queue error type
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct QueueError(#[from] QueueErrorKind);

/// Specific queue error kinds
#[derive(Debug, thiserror::Error)]
pub enum QueueErrorKind {
    /// The topic has no partitions
    #[error("topic {topic} does not exist")]
    TopicNotFound {
        /// Topic name
        topic: String,
    },

    /// The brokers could not be reached
    #[error("queue unavailable: {reason}")]
    Unavailable {
        /// Backend-specific detail
        reason: String,
    },

    /// A message could not be published
    #[error("publish to {topic} failed: {reason}")]
    Publish {
        /// Target topic
        topic: String,
        /// Backend-specific detail
        reason: String,
    },

    /// The client was closed
    #[error("queue client closed")]
    Closed,

    /// Any other backend failure
    #[error("queue backend error: {reason}")]
    Backend {
        /// Backend-specific detail
        reason: String,
    },
}

impl QueueError {
    /// Returns the underlying error kind
    #[must_use]
    pub fn kind(&self) -> &QueueErrorKind {
        &self.0
    }

    /// Returns true if retrying later may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self.0,
            QueueErrorKind::Unavailable { .. } | QueueErrorKind::Publish { .. }
        )
    }

    pub(crate) fn topic_not_found(topic: &str) -> Self {
        Self(QueueErrorKind::TopicNotFound {
            topic: topic.to_string(),
        })
    }

    pub(crate) fn unavailable(reason: impl Into<String>) -> Self {
        Self(QueueErrorKind::Unavailable {
            reason: reason.into(),
        })
    }

    pub(crate) fn publish(topic: &str, reason: impl Into<String>) -> Self {
        Self(QueueErrorKind::Publish {
            topic: topic.to_string(),
            reason: reason.into(),
        })
    }
}

/// Queue result type
pub type QueueResult<T = ()> = Result<T, QueueError>;
