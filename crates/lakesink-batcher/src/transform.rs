//! Record normalization against the target table.
//!
//! A batch locks onto the schema id of its first record; that id is
//! resolved once into a [`TableSchema`] describing the warehouse table
//! the batch is headed for. Every record in the batch is then normalized
//! against that descriptor: column names lowercased, columns unknown to
//! the table dropped, columns missing from the record materialized as
//! NULL so each staged line carries the full column set.

use std::collections::HashMap;
use std::sync::Arc;

use apache_avro::schema::Schema as AvroSchema;
use async_trait::async_trait;
use dashmap::DashMap;

use lakesink_core::CdcRecord;
use lakesink_kafka::SchemaRegistry;

use crate::error::{BatcherError, Result};

/// One column of the target table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    /// Warehouse type the loader will create the column as.
    pub col_type: String,
    /// The upstream Avro type the column was derived from.
    pub source_type: String,
    pub primary_key: bool,
    pub nullable: bool,
}

/// Target-table descriptor for one (topic, schema id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_keys(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }
}

/// Table name for a topic: the last dot-separated segment, lowercased.
/// CDC topics are named `{server}.{schema}.{table}`.
pub fn table_name(topic: &str) -> String {
    topic
        .rsplit('.')
        .next()
        .unwrap_or(topic)
        .to_ascii_lowercase()
}

/// Rewrites one record in place against a table descriptor.
pub trait RecordTransformer: Send + Sync {
    fn transform(&self, record: &mut CdcRecord, table: &TableSchema) -> Result<()>;
}

/// The standard normalization pass.
pub struct CdcTransformer;

impl RecordTransformer for CdcTransformer {
    fn transform(&self, record: &mut CdcRecord, table: &TableSchema) -> Result<()> {
        let mut incoming: HashMap<String, Option<String>> = HashMap::with_capacity(record.value.len());
        for (col, val) in record.value.drain() {
            incoming.insert(col.to_ascii_lowercase(), val);
        }

        let mut normalized = HashMap::with_capacity(table.columns.len());
        for col in &table.columns {
            let value = incoming.remove(&col.name).unwrap_or(None);
            normalized.insert(col.name.clone(), value);
        }
        record.value = normalized;
        Ok(())
    }
}

/// Resolves a (topic, value schema id, key schema id) into a table
/// descriptor.
#[async_trait]
pub trait SchemaResolver: Send + Sync {
    async fn resolve(&self, topic: &str, schema_id: i32, key_schema_id: i32)
        -> Result<TableSchema>;
}

/// Registry-backed resolver with a per-schema-id cache.
///
/// Schema ids are immutable in the registry, so entries never need
/// invalidation; a schema change shows up as a new id and misses.
pub struct AvroSchemaResolver {
    registry: Arc<dyn SchemaRegistry>,
    cache: DashMap<i32, TableSchema>,
}

impl AvroSchemaResolver {
    pub fn new(registry: Arc<dyn SchemaRegistry>) -> Self {
        Self {
            registry,
            cache: DashMap::new(),
        }
    }

    fn columns_from_avro(schema_json: &str, primary_keys: &[String]) -> Result<Vec<ColumnSchema>> {
        let schema = AvroSchema::parse_str(schema_json)
            .map_err(|e| BatcherError::Schema(format!("parsing value schema: {e}")))?;
        let AvroSchema::Record(record) = schema else {
            return Err(BatcherError::Schema(
                "value schema is not an avro record".to_string(),
            ));
        };

        let mut columns = Vec::with_capacity(record.fields.len());
        for field in &record.fields {
            let (col_type, source_type, nullable) = warehouse_type(&field.schema);
            let name = field.name.to_ascii_lowercase();
            let primary_key = primary_keys.contains(&name);
            columns.push(ColumnSchema {
                name,
                col_type,
                source_type,
                primary_key,
                nullable,
            });
        }
        Ok(columns)
    }

    fn key_columns(schema_json: &str) -> Result<Vec<String>> {
        let schema = AvroSchema::parse_str(schema_json)
            .map_err(|e| BatcherError::Schema(format!("parsing key schema: {e}")))?;
        let AvroSchema::Record(record) = schema else {
            // A primitive key schema names no columns.
            return Ok(Vec::new());
        };
        Ok(record
            .fields
            .iter()
            .map(|f| f.name.to_ascii_lowercase())
            .collect())
    }
}

/// Map an Avro field schema to (warehouse type, source type, nullable).
fn warehouse_type(schema: &AvroSchema) -> (String, String, bool) {
    match schema {
        AvroSchema::Union(union) => {
            let inner = union
                .variants()
                .iter()
                .find(|v| !matches!(v, AvroSchema::Null));
            match inner {
                Some(inner) => {
                    let (col, src, _) = warehouse_type(inner);
                    (col, src, true)
                }
                None => ("varchar".to_string(), "null".to_string(), true),
            }
        }
        AvroSchema::String | AvroSchema::Uuid | AvroSchema::Enum(_) => {
            ("varchar".to_string(), "string".to_string(), false)
        }
        AvroSchema::Int => ("int4".to_string(), "int".to_string(), false),
        AvroSchema::Long => ("int8".to_string(), "long".to_string(), false),
        AvroSchema::Float => ("float4".to_string(), "float".to_string(), false),
        AvroSchema::Double => ("float8".to_string(), "double".to_string(), false),
        AvroSchema::Boolean => ("bool".to_string(), "boolean".to_string(), false),
        AvroSchema::Date => ("date".to_string(), "date".to_string(), false),
        AvroSchema::TimestampMillis | AvroSchema::TimestampMicros => {
            ("timestamp".to_string(), "timestamp".to_string(), false)
        }
        other => ("varchar".to_string(), format!("{other:?}"), false),
    }
}

#[async_trait]
impl SchemaResolver for AvroSchemaResolver {
    async fn resolve(
        &self,
        topic: &str,
        schema_id: i32,
        key_schema_id: i32,
    ) -> Result<TableSchema> {
        if let Some(table) = self.cache.get(&schema_id) {
            return Ok(table.clone());
        }

        let value_schema = self.registry.schema_by_id(schema_id).await?;
        let key_schema = self.registry.schema_by_id(key_schema_id).await?;
        let primary_keys = Self::key_columns(&key_schema)?;
        let columns = Self::columns_from_avro(&value_schema, &primary_keys)?;

        let table = TableSchema {
            name: table_name(topic),
            columns,
        };
        self.cache.insert(schema_id, table.clone());
        Ok(table)
    }
}
