//! Error types for the core data model.

use thiserror::Error;

/// Errors produced while building or encoding core types.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An operation tag that is not `c`, `u`, or `d`.
    #[error("unknown operation: '{0}'")]
    UnknownOperation(String),

    /// JSON encoding of a value or mask-schema map failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The load-job Avro schema failed to parse or a field did not fit it.
    #[error("avro error: {0}")]
    Avro(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

impl From<apache_avro::Error> for CoreError {
    fn from(e: apache_avro::Error) -> Self {
        CoreError::Avro(e.to_string())
    }
}
