//! Error types for the batcher.

use thiserror::Error;

/// Errors raised along the staging pipeline.
#[derive(Debug, Error)]
pub enum BatcherError {
    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Schema lookup or table resolution failed.
    #[error("schema error: {0}")]
    Schema(String),

    /// A record inside a batch carried a different schema id than the
    /// batch was locked to. Always a hard error: schema changes must cut
    /// batch boundaries upstream.
    #[error("{topic}: schema id mismatch in the batch, {expected} != {got}")]
    SchemaMismatch {
        topic: String,
        expected: i32,
        got: i32,
    },

    /// Record normalization or masking failed.
    #[error("transform error: {0}")]
    Transform(String),

    /// Writing a staged object to the store failed.
    #[error("upload error: {0}")]
    Upload(String),

    /// Emitting a load-job signal failed.
    #[error("signal error: {0}")]
    Signal(String),

    /// Several batches of one round failed.
    #[error("round errors: {}", .0.join("; "))]
    Round(Vec<String>),

    /// The session context was cancelled. Not a failure; the round is
    /// abandoned and its offsets re-consumed after restart.
    #[error("session context done")]
    SessionDone,

    #[error(transparent)]
    Kafka(#[from] lakesink_kafka::KafkaError),

    #[error(transparent)]
    Core(#[from] lakesink_core::CoreError),
}

/// Result type alias for batcher operations.
pub type Result<T> = std::result::Result<T, BatcherError>;

impl From<serde_json::Error> for BatcherError {
    fn from(e: serde_json::Error) -> Self {
        BatcherError::Transform(format!("encoding value map: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_mismatch_display() {
        let err = BatcherError::SchemaMismatch {
            topic: "db.orders".to_string(),
            expected: 7,
            got: 8,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("db.orders"));
        assert!(msg.contains("7 != 8"));
    }

    #[test]
    fn test_round_joins_messages() {
        let err = BatcherError::Round(vec!["first".to_string(), "second".to_string()]);
        assert_eq!(format!("{}", err), "round errors: first; second");
    }
}
