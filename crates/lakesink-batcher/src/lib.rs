//! lakesink batcher.
//!
//! Consumes CDC topics, batches records per (topic, partition), stages
//! the batches as gzip'd newline-JSON objects in the object store, and
//! signals the downstream loader with one load job per staged batch.
//! Offsets are committed only after every batch of a round is uploaded
//! and signalled, giving at-least-once delivery with idempotent loading
//! downstream.

pub mod config;
pub mod decode;
pub mod dispatch;
pub mod error;
pub mod mask;
pub mod processor;
pub mod sink;
pub mod transform;

pub use config::BatcherConfig;
pub use decode::JsonEnvelopeDecoder;
pub use dispatch::ClaimDispatcher;
pub use error::{BatcherError, Result};
pub use mask::{MaskRules, Masker};
pub use processor::{
    construct_s3_key, BatchProcessor, BatchProcessorFactory, BatchProcessorSettings, MaskSettings,
};
pub use sink::{ManifestEntry, StorageSink};
pub use transform::{
    table_name, AvroSchemaResolver, CdcTransformer, ColumnSchema, RecordTransformer,
    SchemaResolver, TableSchema,
};
