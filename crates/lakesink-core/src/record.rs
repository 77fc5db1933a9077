//! The decoded CDC record.
//!
//! A `CdcRecord` is one row-level change event after the upstream
//! deserializer has unpacked the self-describing wire format: the value is
//! already a column map of nullable strings, and the schema id of the
//! payload travels with the record so the batcher can detect schema
//! changes mid-stream.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// The row-level operation captured by the CDC source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// A new row was inserted.
    Create,
    /// An existing row was updated.
    Update,
    /// A row was deleted.
    Delete,
}

impl Operation {
    /// Parse from the single-letter Debezium tag or the long form.
    pub fn from_tag(s: &str) -> Result<Self> {
        match s {
            "c" | "create" => Ok(Operation::Create),
            "u" | "update" => Ok(Operation::Update),
            "d" | "delete" => Ok(Operation::Delete),
            other => Err(CoreError::UnknownOperation(other.to_string())),
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Create => write!(f, "c"),
            Operation::Update => write!(f, "u"),
            Operation::Delete => write!(f, "d"),
        }
    }
}

/// Mask metadata observed for one column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskInfo {
    /// The column value was replaced by its salted hash.
    pub masked: bool,
    /// The column participates in the warehouse sort key.
    pub sort_col: bool,
    /// The column is the warehouse distribution key.
    pub dist_col: bool,
    /// A `{col}_length` companion column was emitted.
    pub length_col: bool,
}

/// Extra mask metadata for columns with non-default handling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraMaskInfo {
    /// Warehouse type the masked column should be stored as.
    pub mask_type: String,
    /// Value substituted when the source column is NULL.
    pub default_value: Option<String>,
}

/// A decoded CDC event from one (topic, partition).
///
/// `value` maps column names to nullable string renderings; the batcher
/// drops NULL and blank columns before staging. `bytes` is the
/// approximate wire size of the original message and only feeds the
/// processed-bytes counters.
#[derive(Debug, Clone)]
pub struct CdcRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Registry id of the value schema this record was decoded with.
    pub schema_id: i32,
    pub operation: Operation,
    pub key: HashMap<String, String>,
    pub value: HashMap<String, Option<String>>,
    pub mask_schema: HashMap<String, MaskInfo>,
    pub extra_mask_schema: HashMap<String, ExtraMaskInfo>,
    pub bytes: i64,
}

impl CdcRecord {
    /// Drop columns whose value is NULL or trims to the empty string.
    ///
    /// The loader treats absent columns as NULL, so shipping them would
    /// only inflate the staged objects.
    pub fn remove_empty_null_values(&mut self) {
        self.value
            .retain(|_, v| matches!(v, Some(s) if !s.trim().is_empty()));
    }
}
