//! In-process broker.
//!
//! Topics are split into partitions and every consumer group keeps its own
//! offsets per topic, so two groups each see every message while members of
//! one group share a cursor. Offsets advance on delivery, the way an
//! auto-committing consumer behaves. `rewind` replays a topic for a group to
//! reproduce redelivery after a rebalance.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::client::{Consumer, Producer, Subscription};
use crate::{Envelope, Message, QueueError, QueueErrorKind, QueueResult};

const DEFAULT_MAX_BATCH: usize = 64;

#[derive(Debug, Clone)]
struct Record {
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct Topic {
    partitions: Vec<Vec<Record>>,
    round_robin: usize,
}

#[derive(Debug)]
struct Broker {
    topics: HashMap<String, Topic>,
    // (group, topic) -> next offset per partition
    offsets: HashMap<(String, String), Vec<usize>>,
    available: bool,
    reject_publishes: bool,
}

impl Broker {
    fn check_available(&self) -> QueueResult {
        if self.available {
            Ok(())
        } else {
            Err(QueueError::unavailable("broker unreachable"))
        }
    }

    fn publish(&mut self, topic: &str, envelope: Envelope) -> QueueResult<(i32, i64)> {
        self.check_available()?;
        if self.reject_publishes {
            return Err(QueueError::publish(topic, "broker rejected the message"));
        }
        let entry = self
            .topics
            .get_mut(topic)
            .filter(|t| !t.partitions.is_empty())
            .ok_or_else(|| QueueError::topic_not_found(topic))?;

        let count = entry.partitions.len();
        let index = match (envelope.partition, envelope.key.as_deref()) {
            (Some(p), _) => usize::try_from(p)
                .ok()
                .filter(|p| *p < count)
                .ok_or_else(|| QueueError::publish(topic, format!("no partition {p}")))?,
            (None, Some(key)) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                usize::try_from(hasher.finish() % count as u64).unwrap_or(0)
            }
            (None, None) => {
                entry.round_robin = (entry.round_robin + 1) % count;
                entry.round_robin
            }
        };

        let log = &mut entry.partitions[index];
        log.push(Record {
            key: envelope.key.map(String::into_bytes),
            payload: envelope.payload,
        });
        Ok((to_i32(index), to_i64(log.len() - 1)))
    }

    fn take(&mut self, group: &str, topic: &str, max: usize) -> QueueResult<Vec<Message>> {
        self.check_available()?;
        let Some(entry) = self.topics.get(topic) else {
            return Err(QueueError::topic_not_found(topic));
        };
        let offsets = self
            .offsets
            .entry((group.to_string(), topic.to_string()))
            .or_insert_with(|| vec![0; entry.partitions.len()]);
        offsets.resize(entry.partitions.len(), 0);

        let mut batch = Vec::new();
        for (index, log) in entry.partitions.iter().enumerate() {
            while offsets[index] < log.len() && batch.len() < max {
                let offset = offsets[index];
                let record = &log[offset];
                batch.push(Message {
                    topic: topic.to_string(),
                    partition: to_i32(index),
                    offset: to_i64(offset),
                    key: record.key.clone(),
                    payload: record.payload.clone(),
                });
                offsets[index] += 1;
            }
        }
        Ok(batch)
    }
}

fn to_i32(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Shared in-process broker
///
/// Cloning yields another handle onto the same topics.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<Mutex<Broker>>,
    signal: Arc<watch::Sender<u64>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Creates an empty broker
    #[must_use]
    pub fn new() -> Self {
        let (signal, _) = watch::channel(0);
        Self {
            inner: Arc::new(Mutex::new(Broker {
                topics: HashMap::new(),
                offsets: HashMap::new(),
                available: true,
                reject_publishes: false,
            })),
            signal: Arc::new(signal),
        }
    }

    /// Creates `topic` with `partitions` partitions, growing it if it exists
    pub fn create_topic(&self, topic: &str, partitions: usize) {
        let mut inner = self.inner.lock();
        let entry = inner.topics.entry(topic.to_string()).or_default();
        if entry.partitions.len() < partitions {
            entry.partitions.resize_with(partitions, Vec::new);
        }
        debug!(topic, partitions, "topic created");
        drop(inner);
        self.wake();
    }

    /// Returns true if `topic` has at least one partition
    #[must_use]
    pub fn has_topic(&self, topic: &str) -> bool {
        self.inner
            .lock()
            .topics
            .get(topic)
            .is_some_and(|t| !t.partitions.is_empty())
    }

    /// Makes the broker unreachable or reachable again
    pub fn set_available(&self, available: bool) {
        self.inner.lock().available = available;
        self.wake();
    }

    /// Makes every publish fail while polls keep working
    pub fn reject_publishes(&self, reject: bool) {
        self.inner.lock().reject_publishes = reject;
    }

    /// Resets `group`'s offsets on `topic` to the start of every partition
    pub fn rewind(&self, group: &str, topic: &str) {
        let removed = self
            .inner
            .lock()
            .offsets
            .remove(&(group.to_string(), topic.to_string()));
        if removed.is_some() {
            debug!(group, topic, "offsets rewound");
        }
        self.wake();
    }

    /// Every message stored on `topic`, in partition then offset order
    #[must_use]
    pub fn published(&self, topic: &str) -> Vec<Message> {
        let inner = self.inner.lock();
        let Some(entry) = inner.topics.get(topic) else {
            return Vec::new();
        };
        entry
            .partitions
            .iter()
            .enumerate()
            .flat_map(|(index, log)| {
                log.iter().enumerate().map(move |(offset, record)| Message {
                    topic: topic.to_string(),
                    partition: to_i32(index),
                    offset: to_i64(offset),
                    key: record.key.clone(),
                    payload: record.payload.clone(),
                })
            })
            .collect()
    }

    /// Number of messages `group` has not yet received from `topic`
    #[must_use]
    pub fn lag(&self, group: &str, topic: &str) -> usize {
        let inner = self.inner.lock();
        let Some(entry) = inner.topics.get(topic) else {
            return 0;
        };
        let offsets = inner.offsets.get(&(group.to_string(), topic.to_string()));
        entry
            .partitions
            .iter()
            .enumerate()
            .map(|(index, log)| {
                let consumed = offsets.and_then(|o| o.get(index)).copied().unwrap_or(0);
                log.len().saturating_sub(consumed)
            })
            .sum()
    }

    /// Opens a producer on this broker
    #[must_use]
    pub fn producer(&self) -> MemoryProducer {
        MemoryProducer {
            broker: self.clone(),
            closed: AtomicBool::new(false),
        }
    }

    /// Opens a consumer in `group`
    #[must_use]
    pub fn consumer(&self, group: &str) -> MemoryConsumer {
        MemoryConsumer {
            broker: self.clone(),
            group: group.to_string(),
            max_batch: DEFAULT_MAX_BATCH,
        }
    }

    fn wake(&self) {
        self.signal.send_modify(|version| *version = version.wrapping_add(1));
    }
}

/// Producer handle on a [`MemoryBroker`]
#[derive(Debug)]
pub struct MemoryProducer {
    broker: MemoryBroker,
    closed: AtomicBool,
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn send(&self, topic: &str, envelope: Envelope) -> QueueResult {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueErrorKind::Closed.into());
        }
        let (partition, offset) = self.broker.inner.lock().publish(topic, envelope)?;
        trace!(topic, partition, offset, "message stored");
        self.broker.wake();
        Ok(())
    }

    async fn flush(&self) -> QueueResult {
        Ok(())
    }

    async fn close(&self) -> QueueResult {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Consumer-group member on a [`MemoryBroker`]
#[derive(Debug, Clone)]
pub struct MemoryConsumer {
    broker: MemoryBroker,
    group: String,
    max_batch: usize,
}

impl MemoryConsumer {
    /// Caps how many messages one poll returns
    #[must_use]
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn subscribe(&self, topic: &str) -> QueueResult<Box<dyn Subscription>> {
        self.broker.inner.lock().check_available()?;
        if !self.broker.has_topic(topic) {
            return Err(QueueError::topic_not_found(topic));
        }
        debug!(group = %self.group, topic, "subscribed");
        Ok(Box::new(MemorySubscription {
            broker: self.broker.clone(),
            group: self.group.clone(),
            topic: topic.to_string(),
            max_batch: self.max_batch,
            changes: self.broker.signal.subscribe(),
        }))
    }
}

struct MemorySubscription {
    broker: MemoryBroker,
    group: String,
    topic: String,
    max_batch: usize,
    changes: watch::Receiver<u64>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn poll(&mut self, timeout: Duration) -> QueueResult<Vec<Message>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.changes.borrow_and_update();
            let batch = self
                .broker
                .inner
                .lock()
                .take(&self.group, &self.topic, self.max_batch)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            match tokio::time::timeout_at(deadline, self.changes.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(QueueErrorKind::Closed.into()),
                Err(_) => return Ok(Vec::new()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TOPIC: &str = "ktopic-xgboost";

    fn broker() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.create_topic(TOPIC, 2);
        broker
    }

    fn payloads(messages: &[Message]) -> Vec<String> {
        let mut out: Vec<String> = messages
            .iter()
            .map(|m| String::from_utf8_lossy(&m.payload).into_owned())
            .collect();
        out.sort();
        out
    }

    #[tokio::test]
    async fn test_subscribe_to_missing_topic_fails_fast() {
        let broker = MemoryBroker::new();
        let err = broker
            .consumer("g")
            .messages("nope", None)
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), QueueErrorKind::TopicNotFound { .. }));
    }

    #[tokio::test]
    async fn test_group_members_share_cursor() {
        let broker = broker();
        let producer = broker.producer();
        for i in 0..4 {
            producer
                .send(TOPIC, Envelope::new(format!("m{i}")))
                .await
                .unwrap();
        }

        let mut a = broker.consumer("g").with_max_batch(2).subscribe(TOPIC).await.unwrap();
        let mut b = broker.consumer("g").subscribe(TOPIC).await.unwrap();
        let first = a.poll(Duration::from_millis(10)).await.unwrap();
        let rest = b.poll(Duration::from_millis(10)).await.unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(rest.len(), 2);
        let mut all = first;
        all.extend(rest);
        assert_eq!(payloads(&all), vec!["m0", "m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn test_separate_groups_each_see_everything() {
        let broker = broker();
        broker
            .producer()
            .send(TOPIC, Envelope::new("only"))
            .await
            .unwrap();

        let mut a = broker.consumer("g1").subscribe(TOPIC).await.unwrap();
        let mut b = broker.consumer("g2").subscribe(TOPIC).await.unwrap();
        assert_eq!(a.poll(Duration::from_millis(10)).await.unwrap().len(), 1);
        assert_eq!(b.poll(Duration::from_millis(10)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rewind_redelivers() {
        let broker = broker();
        broker.producer().send(TOPIC, Envelope::new("x")).await.unwrap();

        let mut sub = broker.consumer("g").subscribe(TOPIC).await.unwrap();
        assert_eq!(sub.poll(Duration::from_millis(10)).await.unwrap().len(), 1);
        assert_eq!(broker.lag("g", TOPIC), 0);

        broker.rewind("g", TOPIC);
        assert_eq!(broker.lag("g", TOPIC), 1);
        assert_eq!(sub.poll(Duration::from_millis(10)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_explicit_partition_and_keyed_publish() {
        let broker = broker();
        let producer = broker.producer();
        producer
            .send(TOPIC, Envelope::new("p1").with_partition(1))
            .await
            .unwrap();
        producer
            .send(TOPIC, Envelope::new("k").with_key("abc"))
            .await
            .unwrap();
        producer
            .send(TOPIC, Envelope::new("k").with_key("abc"))
            .await
            .unwrap();

        let published = broker.published(TOPIC);
        assert!(published.iter().any(|m| m.partition == 1 && m.payload == b"p1"));
        let keyed: Vec<i32> = published
            .iter()
            .filter(|m| m.key_str().as_deref() == Some("abc"))
            .map(|m| m.partition)
            .collect();
        assert_eq!(keyed.len(), 2);
        assert_eq!(keyed[0], keyed[1]);

        let err = producer
            .send(TOPIC, Envelope::new("bad").with_partition(9))
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), QueueErrorKind::Publish { .. }));
    }

    #[tokio::test]
    async fn test_unavailable_and_rejecting_broker() {
        let broker = broker();
        let producer = broker.producer();

        broker.reject_publishes(true);
        let err = producer.send(TOPIC, Envelope::new("x")).await.unwrap_err();
        assert!(err.is_transient());
        broker.reject_publishes(false);

        broker.set_available(false);
        assert!(producer.send(TOPIC, Envelope::new("x")).await.is_err());
        assert!(broker.consumer("g").subscribe(TOPIC).await.is_err());
        broker.set_available(true);
        assert!(producer.send(TOPIC, Envelope::new("x")).await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_producer_rejects_sends() {
        let broker = broker();
        let producer = broker.producer();
        producer.close().await.unwrap();
        let err = producer.send(TOPIC, Envelope::new("x")).await.unwrap_err();
        assert!(matches!(err.kind(), QueueErrorKind::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reported_once_per_window() {
        let broker = broker();
        let mut stream = broker
            .consumer("g")
            .messages(TOPIC, Some(Duration::from_secs(5)))
            .await
            .unwrap();

        let start = tokio::time::Instant::now();
        for window in 1..=3u32 {
            let batch = stream.next_batch().await.unwrap();
            assert!(batch.timed_out);
            assert!(batch.messages.is_empty());
            assert_eq!(start.elapsed(), Duration::from_secs(5) * window);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_wakes_on_publish() {
        let broker = broker();
        let mut stream = broker
            .consumer("g")
            .messages(TOPIC, Some(Duration::from_secs(5)))
            .await
            .unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            publisher
                .producer()
                .send(TOPIC, Envelope::new("late"))
                .await
                .unwrap();
        });

        let batch = stream.next_batch().await.unwrap();
        assert!(!batch.timed_out);
        assert_eq!(payloads(&batch.messages), vec!["late"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_untimed_stream_waits_for_messages() {
        let broker = broker();
        let mut stream = broker.consumer("g").messages(TOPIC, None).await.unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            publisher
                .producer()
                .send(TOPIC, Envelope::new("eventually"))
                .await
                .unwrap();
        });

        let batch = stream.next_batch().await.unwrap();
        assert!(!batch.timed_out);
        assert_eq!(batch.messages.len(), 1);
    }
}
