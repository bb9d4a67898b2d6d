//! Connections to the coordination service and the message queue.
//!
//! The live backends are compiled in with the `zookeeper` and `kafka`
//! features.

use anyhow::Result;
use benchq_coord::Coordination;
use benchq_core::{CoordinationConfig, QueueConfig};
use benchq_queue::{Consumer, Producer};
use std::sync::Arc;

/// Opens a coordination session
///
/// # Errors
///
/// Returns an error if the ensemble cannot be reached.
#[cfg(feature = "zookeeper")]
pub async fn coordination(config: &CoordinationConfig) -> Result<Arc<dyn Coordination>> {
    use anyhow::Context;

    let session = benchq_coord::ZkCoordination::connect(&config.hosts, config.session_timeout())
        .await
        .with_context(|| format!("connecting to ZooKeeper at {}", config.hosts))?;
    Ok(Arc::new(session))
}

/// Opens a coordination session
///
/// # Errors
///
/// Always fails: this build has no ZooKeeper support.
#[cfg(not(feature = "zookeeper"))]
#[allow(clippy::unused_async)]
pub async fn coordination(config: &CoordinationConfig) -> Result<Arc<dyn Coordination>> {
    anyhow::bail!(
        "cannot connect to {}: built without ZooKeeper support (rebuild with --features zookeeper)",
        config.hosts
    )
}

/// Creates a consumer for the configured group
///
/// # Errors
///
/// Fails if this build has no Kafka support.
#[cfg(feature = "kafka")]
pub fn consumer(config: &QueueConfig) -> Result<Arc<dyn Consumer>> {
    Ok(Arc::new(benchq_queue::KafkaConsumer::new(config)))
}

/// Creates a consumer for the configured group
///
/// # Errors
///
/// Always fails: this build has no Kafka support.
#[cfg(not(feature = "kafka"))]
pub fn consumer(config: &QueueConfig) -> Result<Arc<dyn Consumer>> {
    anyhow::bail!(
        "cannot consume from {}: built without Kafka support (rebuild with --features kafka)",
        config.brokers
    )
}

/// Creates a producer; it connects on first send
///
/// # Errors
///
/// Fails if this build has no Kafka support.
#[cfg(feature = "kafka")]
pub fn producer(config: &QueueConfig) -> Result<Arc<dyn Producer>> {
    Ok(Arc::new(benchq_queue::KafkaProducer::new(config)))
}

/// Creates a producer; it connects on first send
///
/// # Errors
///
/// Always fails: this build has no Kafka support.
#[cfg(not(feature = "kafka"))]
pub fn producer(config: &QueueConfig) -> Result<Arc<dyn Producer>> {
    anyhow::bail!(
        "cannot publish to {}: built without Kafka support (rebuild with --features kafka)",
        config.brokers
    )
}
