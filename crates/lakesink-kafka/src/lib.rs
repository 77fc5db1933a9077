//! Kafka client layer for lakesink.
//!
//! Everything the pipeline needs from the bus lives behind traits here:
//! [`Watcher`] for metadata and offset queries, [`ConsumerGroup`] +
//! [`ClaimHandler`] for rebalancing claim sessions, [`RecordProducer`]
//! for the signal path, and [`SchemaRegistry`] for schema lookups. The
//! `Kafka*` types are the rdkafka-backed implementations; tests swap in
//! in-process fakes.

pub mod consumer;
pub mod error;
pub mod manager;
pub mod producer;
pub mod registry;
pub mod watcher;

pub use consumer::{
    Claim, ClaimHandler, ConsumerGroup, GroupSession, KafkaConsumerGroup, RecordDecoder,
};
pub use error::{KafkaError, Result};
pub use manager::TopicManager;
pub use producer::{frame_with_schema_id, AvroProducer, KafkaRecordProducer, RecordProducer};
pub use registry::{subject_name, HttpSchemaRegistry, RegisteredSchema, SchemaRegistry};
pub use watcher::{KafkaWatcher, Watcher};

/// Consumer group naming convention shared by the batcher and the
/// reconciler: `{sink}-{namespace}-{group}{suffix}` where the suffix is
/// `-batcher` or `-loader`.
pub fn consumer_group_id(sink_name: &str, namespace: &str, group_id: &str, suffix: &str) -> String {
    format!("{sink_name}-{namespace}-{group_id}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_group_id() {
        assert_eq!(
            consumer_group_id("orders-sink", "data", "main", "-batcher"),
            "orders-sink-data-main-batcher"
        );
        assert_eq!(
            consumer_group_id("orders-sink", "data", "reload", "-loader"),
            "orders-sink-data-reload-loader"
        );
    }
}
