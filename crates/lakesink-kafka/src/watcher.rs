//! Offset watcher: topic listing and offset queries.
//!
//! The reconciler's lag math and the topic manager's discovery both go
//! through the [`Watcher`] trait so they can run against an in-process
//! fake in tests. [`KafkaWatcher`] is the broker-backed implementation;
//! every query builds a short-lived `BaseConsumer` and runs on the
//! blocking pool because the underlying client is synchronous.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::{Offset, TopicPartitionList};

use crate::error::{KafkaError, Result};

/// Read-only view of broker state.
#[async_trait]
pub trait Watcher: Send + Sync {
    /// All topics known to the cluster.
    async fn topics(&self) -> Result<Vec<String>>;

    /// High watermark of (topic, partition).
    async fn last_offset(&self, topic: &str, partition: i32) -> Result<i64>;

    /// Last committed offset of the consumer group on (topic, partition).
    ///
    /// Returns `-1` when the group has no commit there, which is also what
    /// the broker reports for a group that has expired due to inactivity.
    async fn current_offset(&self, group_id: &str, topic: &str, partition: i32) -> Result<i64>;
}

/// Broker-backed [`Watcher`].
pub struct KafkaWatcher {
    brokers: String,
    timeout: Duration,
}

impl KafkaWatcher {
    pub fn new(brokers: &str) -> Self {
        Self {
            brokers: brokers.to_string(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn client_config(&self, group_id: Option<&str>) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.brokers);
        config.set("enable.auto.commit", "false");
        // A group id is only needed for committed-offset lookups; metadata
        // and watermark queries use a throwaway group.
        config.set("group.id", group_id.unwrap_or("lakesink-watcher"));
        config
    }
}

#[async_trait]
impl Watcher for KafkaWatcher {
    async fn topics(&self) -> Result<Vec<String>> {
        let config = self.client_config(None);
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || {
            let consumer: BaseConsumer = config
                .create()
                .map_err(|e| KafkaError::Watcher(format!("creating metadata client: {e}")))?;
            let metadata = consumer
                .fetch_metadata(None, timeout)
                .map_err(|e| KafkaError::Watcher(format!("fetching metadata: {e}")))?;
            Ok(metadata
                .topics()
                .iter()
                .map(|t| t.name().to_string())
                .collect())
        })
        .await
        .map_err(|e| KafkaError::Watcher(format!("metadata task: {e}")))?
    }

    async fn last_offset(&self, topic: &str, partition: i32) -> Result<i64> {
        let config = self.client_config(None);
        let timeout = self.timeout;
        let topic = topic.to_string();
        tokio::task::spawn_blocking(move || {
            let consumer: BaseConsumer = config
                .create()
                .map_err(|e| KafkaError::Watcher(format!("creating watermark client: {e}")))?;
            let (_low, high) = consumer
                .fetch_watermarks(&topic, partition, timeout)
                .map_err(|e| {
                    KafkaError::Watcher(format!("fetching watermarks for {topic}/{partition}: {e}"))
                })?;
            Ok(high)
        })
        .await
        .map_err(|e| KafkaError::Watcher(format!("watermark task: {e}")))?
    }

    async fn current_offset(&self, group_id: &str, topic: &str, partition: i32) -> Result<i64> {
        let config = self.client_config(Some(group_id));
        let timeout = self.timeout;
        let topic = topic.to_string();
        let group = group_id.to_string();
        tokio::task::spawn_blocking(move || {
            let consumer: BaseConsumer = config
                .create()
                .map_err(|e| KafkaError::Watcher(format!("creating offset client: {e}")))?;
            let mut tpl = TopicPartitionList::new();
            tpl.add_partition(&topic, partition);
            let committed = consumer.committed_offsets(tpl, timeout).map_err(|e| {
                KafkaError::Watcher(format!(
                    "fetching committed offset for {group} on {topic}/{partition}: {e}"
                ))
            })?;
            let elem = committed
                .elements()
                .into_iter()
                .next()
                .ok_or_else(|| KafkaError::Watcher(format!("no offset element for {topic}")))?;
            match elem.offset() {
                Offset::Offset(o) => Ok(o),
                // No commit stored for this group: the caller's convention
                // for "group not found".
                _ => Ok(-1),
            }
        })
        .await
        .map_err(|e| KafkaError::Watcher(format!("offset task: {e}")))?
    }
}
