//! Error types for the reconciler.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcilerError {
    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Loading or patching the status record failed.
    #[error("status error: {0}")]
    Status(String),

    /// Reconciling a sink group's deployment failed.
    #[error("deploy error: {0}")]
    Deploy(String),

    /// Several failures from one reconcile tick.
    #[error("reconcile errors: {}", .0.join("; "))]
    Aggregate(Vec<String>),

    #[error(transparent)]
    Kafka(#[from] lakesink_kafka::KafkaError),
}

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, ReconcilerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_joins_messages() {
        let err = ReconcilerError::Aggregate(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(format!("{}", err), "reconcile errors: a; b");
    }
}
