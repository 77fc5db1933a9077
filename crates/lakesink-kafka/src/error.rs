//! Error types for the Kafka client layer.

use thiserror::Error;

/// Errors from the bus client, the signal producer, and the schema
/// registry client.
#[derive(Debug, Error)]
pub enum KafkaError {
    /// Invalid or missing client configuration (bad regex, bad brokers).
    #[error("configuration error: {0}")]
    Config(String),

    /// Metadata or offset query against the brokers failed.
    #[error("watcher error: {0}")]
    Watcher(String),

    /// Consumer group session failed or could not be created.
    #[error("consume error: {0}")]
    Consume(String),

    /// Producing a record to the bus failed.
    #[error("produce error: {0}")]
    Produce(String),

    /// Schema registry request failed.
    #[error("schema registry error: {0}")]
    Registry(String),

    /// Avro encoding of an outgoing record failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The session context was cancelled; not a failure.
    #[error("session context done")]
    SessionDone,
}

/// Result type alias for bus operations.
pub type Result<T> = std::result::Result<T, KafkaError>;

impl From<rdkafka::error::KafkaError> for KafkaError {
    fn from(e: rdkafka::error::KafkaError) -> Self {
        KafkaError::Watcher(e.to_string())
    }
}

impl From<apache_avro::Error> for KafkaError {
    fn from(e: apache_avro::Error) -> Self {
        KafkaError::Serialization(e.to_string())
    }
}

impl From<lakesink_core::CoreError> for KafkaError {
    fn from(e: lakesink_core::CoreError) -> Self {
        KafkaError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_done_is_distinguishable() {
        let err = KafkaError::SessionDone;
        assert!(matches!(err, KafkaError::SessionDone));
        assert_eq!(format!("{}", err), "session context done");
    }

    #[test]
    fn test_display_carries_detail() {
        let err = KafkaError::Consume("rebalance in progress".to_string());
        assert!(format!("{}", err).contains("rebalance in progress"));
    }
}
