//! The load-job signal.
//!
//! One `LoadJob` describes one staged object: which topic it came from,
//! the offset range it covers, where it sits in the object store, and the
//! schema ids the loader needs to merge it. Jobs travel to the loader
//! topic as Avro records under [`JOB_AVRO_SCHEMA`].

use std::collections::HashMap;

use apache_avro::types::{Record as AvroRecord, Value as AvroValue};
use apache_avro::Schema;

use crate::error::{CoreError, Result};
use crate::record::{ExtraMaskInfo, MaskInfo};

/// Avro schema for the loader topic's value records.
///
/// `skipMerge` is deprecated: it is always `false` on new messages and is
/// kept on the wire only so older loaders keep deserializing.
pub const JOB_AVRO_SCHEMA: &str = r#"{
    "type": "record",
    "name": "loader",
    "fields": [
        {"name": "upstreamTopic", "type": "string"},
        {"name": "startOffset", "type": "long"},
        {"name": "endOffset", "type": "long"},
        {"name": "csvDialect", "type": "string"},
        {"name": "s3Path", "type": "string"},
        {"name": "schemaId", "type": "int"},
        {"name": "schemaIdKey", "type": "int"},
        {"name": "maskSchema", "type": "string"},
        {"name": "extraMaskSchema", "type": "string"},
        {"name": "skipMerge", "type": "boolean"},
        {"name": "batchBytes", "type": "long"},
        {"name": "createEvents", "type": "long"},
        {"name": "updateEvents", "type": "long"},
        {"name": "deleteEvents", "type": "long"}
    ]
}"#;

/// Signal telling the loader to merge one staged object.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadJob {
    pub upstream_topic: String,
    pub start_offset: i64,
    pub end_offset: i64,
    /// Column separator the loader should assume, always `,` today.
    pub csv_dialect: String,
    /// Object URI of the staged batch, e.g. `s3://bucket/dir/key.json.gz`.
    pub s3_path: String,
    /// Registry id of the upstream topic's value schema.
    pub schema_id: i32,
    /// Registry id of the upstream topic's key schema, used by the loader
    /// to resolve primary keys.
    pub schema_id_key: i32,
    pub mask_schema: HashMap<String, MaskInfo>,
    pub extra_mask_schema: HashMap<String, ExtraMaskInfo>,
    /// Deprecated, always false.
    pub skip_merge: bool,
    pub batch_bytes: i64,
    pub create_events: i64,
    pub update_events: i64,
    pub delete_events: i64,
}

impl LoadJob {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        upstream_topic: &str,
        start_offset: i64,
        end_offset: i64,
        csv_dialect: &str,
        s3_path: String,
        schema_id: i32,
        schema_id_key: i32,
        mask_schema: HashMap<String, MaskInfo>,
        extra_mask_schema: HashMap<String, ExtraMaskInfo>,
        batch_bytes: i64,
        create_events: i64,
        update_events: i64,
        delete_events: i64,
    ) -> Self {
        Self {
            upstream_topic: upstream_topic.to_string(),
            start_offset,
            end_offset,
            csv_dialect: csv_dialect.to_string(),
            s3_path,
            schema_id,
            schema_id_key,
            mask_schema,
            extra_mask_schema,
            skip_merge: false,
            batch_bytes,
            create_events,
            update_events,
            delete_events,
        }
    }

    /// Parse [`JOB_AVRO_SCHEMA`] into an `apache_avro` schema.
    pub fn avro_schema() -> Result<Schema> {
        Ok(Schema::parse_str(JOB_AVRO_SCHEMA)?)
    }

    /// Render this job as an Avro value under the given schema.
    ///
    /// The mask maps are embedded as JSON strings: the loader only passes
    /// them through to its own schema migrator, so a nested Avro encoding
    /// would buy nothing.
    pub fn to_avro(&self, schema: &Schema) -> Result<AvroValue> {
        let mut rec = AvroRecord::new(schema)
            .ok_or_else(|| CoreError::Avro("schema is not a record".to_string()))?;

        rec.put("upstreamTopic", self.upstream_topic.as_str());
        rec.put("startOffset", self.start_offset);
        rec.put("endOffset", self.end_offset);
        rec.put("csvDialect", self.csv_dialect.as_str());
        rec.put("s3Path", self.s3_path.as_str());
        rec.put("schemaId", self.schema_id);
        rec.put("schemaIdKey", self.schema_id_key);
        rec.put("maskSchema", serde_json::to_string(&self.mask_schema)?);
        rec.put(
            "extraMaskSchema",
            serde_json::to_string(&self.extra_mask_schema)?,
        );
        rec.put("skipMerge", self.skip_merge);
        rec.put("batchBytes", self.batch_bytes);
        rec.put("createEvents", self.create_events);
        rec.put("updateEvents", self.update_events);
        rec.put("deleteEvents", self.delete_events);

        Ok(rec.into())
    }
}
