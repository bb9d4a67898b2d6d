//! Producer and consumer traits.

use async_trait::async_trait;
use std::time::Duration;
use tracing::trace;

use crate::{Envelope, Message, PollBatch, QueueResult};

/// Poll window used when the caller does not supply one
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Publishes messages to topics
#[async_trait]
pub trait Producer: Send + Sync {
    /// Sends one message, connecting first if needed
    async fn send(&self, topic: &str, envelope: Envelope) -> QueueResult;

    /// Blocks until every buffered message is acknowledged
    async fn flush(&self) -> QueueResult;

    /// Flushes and releases the connection
    async fn close(&self) -> QueueResult;
}

/// Consumes messages as a member of a consumer group
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Joins the group on `topic`
    ///
    /// Fails with `TopicNotFound` if the topic has no partitions.
    async fn subscribe(&self, topic: &str) -> QueueResult<Box<dyn Subscription>>;

    /// Subscribes to `topic` and wraps the subscription in a stream
    ///
    /// With `timeout` set, every poll window that elapses without a message
    /// is reported as a timed-out batch. Without it, polls repeat with
    /// [`DEFAULT_POLL_TIMEOUT`] until messages arrive.
    async fn messages(
        &self,
        topic: &str,
        timeout: Option<Duration>,
    ) -> QueueResult<MessageStream> {
        let subscription = self.subscribe(topic).await?;
        Ok(MessageStream::new(subscription, timeout))
    }
}

/// An active subscription
#[async_trait]
pub trait Subscription: Send {
    /// Waits up to `timeout` for messages and returns whatever arrived
    async fn poll(&mut self, timeout: Duration) -> QueueResult<Vec<Message>>;
}

/// Lazy, unbounded sequence of poll results over one subscription
pub struct MessageStream {
    subscription: Box<dyn Subscription>,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for MessageStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStream")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl MessageStream {
    /// Wraps a subscription
    #[must_use]
    pub fn new(subscription: Box<dyn Subscription>, timeout: Option<Duration>) -> Self {
        Self {
            subscription,
            timeout,
        }
    }

    /// Returns the next poll result
    ///
    /// # Errors
    ///
    /// Returns any error raised by the underlying poll.
    pub async fn next_batch(&mut self) -> QueueResult<PollBatch> {
        if let Some(timeout) = self.timeout {
            let messages = self.subscription.poll(timeout).await?;
            if messages.is_empty() {
                return Ok(PollBatch::timeout());
            }
            return Ok(PollBatch {
                messages,
                timed_out: false,
            });
        }

        loop {
            let messages = self.subscription.poll(DEFAULT_POLL_TIMEOUT).await?;
            if !messages.is_empty() {
                trace!(count = messages.len(), "poll returned messages");
                return Ok(PollBatch {
                    messages,
                    timed_out: false,
                });
            }
        }
    }
}
