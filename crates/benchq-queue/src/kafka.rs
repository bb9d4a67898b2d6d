//! Kafka backend.
//!
//! The producer connects lazily on the first send and keeps retrying the
//! connection on later sends if that fails. Every call to `subscribe`
//! builds a fresh group member, so a caller that hits an error can simply
//! subscribe again.

use async_trait::async_trait;
use benchq_core::QueueConfig;
use once_cell::sync::OnceCell;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer as _, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message as _};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as _};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::client::{Consumer, Producer, Subscription};
use crate::{Envelope, Message, QueueError, QueueErrorKind, QueueResult};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Kafka producer
pub struct KafkaProducer {
    brokers: String,
    client_id: String,
    inner: OnceCell<FutureProducer>,
    closed: AtomicBool,
}

impl std::fmt::Debug for KafkaProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaProducer")
            .field("brokers", &self.brokers)
            .field("client_id", &self.client_id)
            .field("connected", &self.inner.get().is_some())
            .finish_non_exhaustive()
    }
}

impl KafkaProducer {
    /// Creates a producer; no connection is made until the first send
    #[must_use]
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            brokers: config.brokers.clone(),
            client_id: config.client_id.clone(),
            inner: OnceCell::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn connected(&self) -> QueueResult<&FutureProducer> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueErrorKind::Closed.into());
        }
        self.inner.get_or_try_init(|| {
            let producer: FutureProducer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("client.id", &self.client_id)
                .set("message.send.max.retries", "1")
                .create()
                .map_err(|e| {
                    warn!(brokers = %self.brokers, error = %e, "producer connection failed");
                    QueueError::unavailable(e.to_string())
                })?;
            info!(brokers = %self.brokers, client_id = %self.client_id, "producer connected");
            Ok(producer)
        })
    }
}

#[async_trait]
impl Producer for KafkaProducer {
    async fn send(&self, topic: &str, envelope: Envelope) -> QueueResult {
        let producer = self.connected()?;
        let mut record = FutureRecord::<str, [u8]>::to(topic).payload(&envelope.payload);
        if let Some(key) = envelope.key.as_deref() {
            record = record.key(key);
        }
        if let Some(partition) = envelope.partition {
            record = record.partition(partition);
        }

        match producer.send(record, Timeout::After(DELIVERY_TIMEOUT)).await {
            Ok(delivery) => {
                trace!(topic, ?delivery, "message delivered");
                Ok(())
            }
            Err((e, _)) => {
                warn!(topic, error = %e, "publish failed");
                Err(QueueError::publish(topic, e.to_string()))
            }
        }
    }

    async fn flush(&self) -> QueueResult {
        let Some(producer) = self.inner.get().cloned() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(DELIVERY_TIMEOUT)))
            .await
            .map_err(|e| QueueError::from(QueueErrorKind::Backend {
                reason: e.to_string(),
            }))?
            .map_err(map_kafka_error)
    }

    async fn close(&self) -> QueueResult {
        let result = self.flush().await;
        self.closed.store(true, Ordering::Release);
        result
    }
}

/// Kafka consumer-group member factory
#[derive(Debug, Clone)]
pub struct KafkaConsumer {
    brokers: String,
    group: String,
    client_id: String,
    max_batch: usize,
}

impl KafkaConsumer {
    /// Creates a consumer for `config.group`
    #[must_use]
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            brokers: config.brokers.clone(),
            group: config.group.clone(),
            client_id: config.client_id.clone(),
            max_batch: config.max_batch.max(1),
        }
    }

    fn build(&self) -> QueueResult<StreamConsumer> {
        ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group)
            .set("client.id", &self.client_id)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(map_kafka_error)
    }
}

#[async_trait]
impl Consumer for KafkaConsumer {
    async fn subscribe(&self, topic: &str) -> QueueResult<Box<dyn Subscription>> {
        let consumer = Arc::new(self.build()?);

        let probe = Arc::clone(&consumer);
        let name = topic.to_string();
        let partitions = tokio::task::spawn_blocking(move || {
            let metadata = probe.fetch_metadata(Some(&name), Timeout::After(METADATA_TIMEOUT))?;
            Ok::<_, KafkaError>(
                metadata
                    .topics()
                    .iter()
                    .find(|t| t.name() == name && t.error().is_none())
                    .map_or(0, |t| t.partitions().len()),
            )
        })
        .await
        .map_err(|e| QueueError::from(QueueErrorKind::Backend {
            reason: e.to_string(),
        }))?
        .map_err(map_kafka_error)?;

        if partitions == 0 {
            return Err(QueueError::topic_not_found(topic));
        }
        consumer.subscribe(&[topic]).map_err(map_kafka_error)?;
        debug!(group = %self.group, topic, partitions, "subscribed");

        Ok(Box::new(KafkaSubscription {
            consumer,
            max_batch: self.max_batch,
        }))
    }
}

struct KafkaSubscription {
    consumer: Arc<StreamConsumer>,
    max_batch: usize,
}

#[async_trait]
impl Subscription for KafkaSubscription {
    async fn poll(&mut self, timeout: Duration) -> QueueResult<Vec<Message>> {
        let first = match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => return Ok(Vec::new()),
            Ok(received) => received.map(|m| to_message(&m)).map_err(map_kafka_error)?,
        };

        let mut batch = vec![first];
        while batch.len() < self.max_batch {
            match tokio::time::timeout(Duration::ZERO, self.consumer.recv()).await {
                Ok(Ok(m)) => batch.push(to_message(&m)),
                Ok(Err(e)) => {
                    warn!(error = %e, "error while draining poll");
                    break;
                }
                Err(_) => break,
            }
        }
        Ok(batch)
    }
}

fn to_message(m: &BorrowedMessage<'_>) -> Message {
    Message {
        topic: m.topic().to_string(),
        partition: m.partition(),
        offset: m.offset(),
        key: m.key().map(<[u8]>::to_vec),
        payload: m.payload().map(<[u8]>::to_vec).unwrap_or_default(),
    }
}

fn map_kafka_error(e: KafkaError) -> QueueError {
    match e {
        KafkaError::ClientCreation(reason) => QueueError::unavailable(reason),
        KafkaError::MetadataFetch(code) | KafkaError::MessageConsumption(code) => {
            QueueError::unavailable(code.to_string())
        }
        other => QueueErrorKind::Backend {
            reason: other.to_string(),
        }
        .into(),
    }
}
