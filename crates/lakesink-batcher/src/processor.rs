//! The batch processor.
//!
//! One processor owns one (topic, partition). Upstream, the claim
//! dispatcher cuts the record stream into buffers; the processor drains
//! up to `max_concurrency` of them per round (or settles for what it has
//! after a timeout tick), runs each buffer through
//! transform → mask → serialize → gzip → upload in parallel, signals the
//! loader once per uploaded batch, and marks the round's end offset on
//! the session. Either every batch of a round commits or none does.
//!
//! Crash anywhere before the mark re-consumes the same offsets after
//! restart; a crash between signal and mark can duplicate a load job,
//! which the loader is required to absorb by (startOffset, endOffset).

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use apache_avro::Schema as AvroSchema;
use bytes::Bytes;
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use lakesink_core::{CdcRecord, ExtraMaskInfo, LoadJob, MaskInfo, Operation, JOB_AVRO_SCHEMA};
use lakesink_kafka::{AvroProducer, GroupSession, SchemaRegistry};

use crate::error::{BatcherError, Result};
use crate::mask::{MaskRules, Masker};
use crate::sink::StorageSink;
use crate::transform::{CdcTransformer, RecordTransformer, SchemaResolver, TableSchema};

/// How long a partial round waits for more buffers before processing.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Staged object key for a batch, deterministic over its inputs.
///
/// Layout:
/// `{bucket_dir}/{group}/{topic}/[{mask_version}/]{offset}_offset_{partition}_partition.json.gz`
/// with the offset taken from the first record of the batch.
pub fn construct_s3_key(
    bucket_dir: &str,
    consumer_group_id: &str,
    topic: &str,
    partition: i32,
    offset: i64,
    mask_version: Option<&str>,
) -> String {
    let file_name = format!("{offset}_offset_{partition}_partition.json.gz");
    match mask_version {
        Some(version) if !version.is_empty() => {
            format!("{bucket_dir}/{consumer_group_id}/{topic}/{version}/{file_name}")
        }
        _ => format!("{bucket_dir}/{consumer_group_id}/{topic}/{file_name}"),
    }
}

/// Gzip a staged body. A compression failure here means the in-memory
/// encoder itself broke, which is unrecoverable.
fn gzip_body(body: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(4096), Compression::default());
    if let Err(e) = encoder.write_all(body) {
        panic!("compressing staged batch: {e}");
    }
    match encoder.finish() {
        Ok(compressed) => compressed,
        Err(e) => panic!("finishing staged batch compression: {e}"),
    }
}

/// Result of processing one drained buffer.
struct BatchResponse {
    batch_id: usize,
    schema_id: i32,
    s3_key: String,
    start_offset: i64,
    end_offset: i64,
    create_events: i64,
    update_events: i64,
    delete_events: i64,
    bytes_processed: i64,
    messages_processed: usize,
    mask_schema: HashMap<String, MaskInfo>,
    extra_mask_schema: HashMap<String, ExtraMaskInfo>,
}

/// Construction parameters for one processor.
pub struct BatchProcessorSettings {
    pub topic: String,
    pub partition: i32,
    pub consumer_group_id: String,
    pub loader_topic_prefix: String,
    pub auto_commit: bool,
    pub bucket_dir: String,
    pub mask_version: Option<String>,
    pub max_concurrency: usize,
    /// Registry id of the loader topic's value schema.
    pub loader_schema_id: i32,
    /// Registry id of the upstream topic's key schema.
    pub key_schema_id: i32,
}

pub struct BatchProcessor {
    topic: String,
    partition: i32,
    consumer_group_id: String,
    loader_topic: String,
    auto_commit: bool,
    bucket_dir: String,
    mask_version: Option<String>,
    max_concurrency: usize,
    loader_schema_id: i32,
    key_schema_id: i32,

    sink: Arc<StorageSink>,
    transformer: Arc<dyn RecordTransformer>,
    resolver: Arc<dyn SchemaResolver>,
    masker: Option<Arc<Masker>>,
    signaler: Arc<AvroProducer>,
    loader_schema: AvroSchema,
    signal_seq: AtomicU64,
}

impl BatchProcessor {
    pub fn new(
        settings: BatchProcessorSettings,
        sink: Arc<StorageSink>,
        resolver: Arc<dyn SchemaResolver>,
        masker: Option<Arc<Masker>>,
        signaler: Arc<AvroProducer>,
    ) -> Result<Self> {
        let loader_schema = AvroSchema::parse_str(JOB_AVRO_SCHEMA)
            .map_err(|e| BatcherError::Schema(format!("parsing load-job schema: {e}")))?;
        Ok(Self {
            loader_topic: format!("{}{}", settings.loader_topic_prefix, settings.topic),
            topic: settings.topic,
            partition: settings.partition,
            consumer_group_id: settings.consumer_group_id,
            auto_commit: settings.auto_commit,
            bucket_dir: settings.bucket_dir,
            mask_version: settings.mask_version,
            max_concurrency: settings.max_concurrency.max(1),
            loader_schema_id: settings.loader_schema_id,
            key_schema_id: settings.key_schema_id,
            sink,
            transformer: Arc::new(CdcTransformer),
            resolver,
            masker,
            signaler,
            loader_schema,
            signal_seq: AtomicU64::new(0),
        })
    }

    /// Drive rounds until the session ends or a round fails.
    ///
    /// Exactly one error per failing round is written to `errors`; the
    /// caller treats it as a consumer group error and tears the session
    /// down. Returning without an error means the session context was
    /// cancelled or the buffer channel closed.
    pub async fn process(
        self: Arc<Self>,
        session: Arc<dyn GroupSession>,
        mut buffers: mpsc::Receiver<Vec<CdcRecord>>,
        errors: mpsc::Sender<BatcherError>,
    ) {
        let token = session.context();
        let mut timeout = tokio::time::interval_at(
            tokio::time::Instant::now() + DRAIN_TIMEOUT,
            DRAIN_TIMEOUT,
        );
        timeout.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        debug!(topic = %self.topic, partition = self.partition, "processor started");

        loop {
            // Drain up to max_concurrency buffers, or settle for a partial
            // round after a timeout tick. A tick with nothing drained just
            // keeps waiting.
            let mut drained: Vec<Vec<CdcRecord>> = Vec::new();
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!(topic = %self.topic, "processor returning, session context done");
                        return;
                    }
                    received = buffers.recv() => match received {
                        Some(buf) => {
                            drained.push(buf);
                            if drained.len() == self.max_concurrency {
                                break;
                            }
                        }
                        None => {
                            // Claim ended. Finish what was already drained;
                            // the next drain pass returns for good.
                            if drained.is_empty() {
                                debug!(topic = %self.topic, "buffer channel closed, processor returning");
                                return;
                            }
                            break;
                        }
                    },
                    _ = timeout.tick() => {
                        if !drained.is_empty() {
                            break;
                        }
                    }
                }
            }

            debug!(topic = %self.topic, batches = drained.len(), "processing round");
            let round = drained
                .into_iter()
                .enumerate()
                .map(|(i, buf)| self.process_batch(&token, i + 1, buf));
            let results = join_all(round).await;

            let mut responses = Vec::with_capacity(results.len());
            let mut failures: Vec<String> = Vec::new();
            let mut cancelled = false;
            for result in results {
                match result {
                    Ok(resp) => responses.push(resp),
                    Err(BatcherError::SessionDone) => cancelled = true,
                    Err(e) => failures.push(e.to_string()),
                }
            }
            if cancelled {
                debug!(topic = %self.topic, "processor returning, session context done");
                return;
            }
            if !failures.is_empty() {
                error!(topic = %self.topic, errors = failures.len(), "round failed");
                self.shutdown_signaler().await;
                self.report(&token, &errors, BatcherError::Round(failures))
                    .await;
                return;
            }

            // All uploads landed; signal in batch order, then mark once.
            for resp in &responses {
                if token.is_cancelled() {
                    debug!(topic = %self.topic, "processor returning, session context done");
                    return;
                }
                if let Err(e) = self.signal_load(resp).await {
                    error!(topic = %self.topic, error = %e, "signalling failed");
                    self.shutdown_signaler().await;
                    self.report(&token, &errors, e).await;
                    return;
                }
            }

            let first = &responses[0];
            let last = &responses[responses.len() - 1];
            self.mark_round(&session, last.end_offset).await;
            info!(
                topic = %self.topic,
                start_offset = first.start_offset,
                end_offset = last.end_offset,
                batches = responses.len(),
                "round processed"
            );
        }
    }

    /// Transform, serialize, compress, and upload one buffer.
    async fn process_batch(
        &self,
        token: &CancellationToken,
        batch_id: usize,
        buf: Vec<CdcRecord>,
    ) -> Result<BatchResponse> {
        if token.is_cancelled() {
            return Err(BatcherError::SessionDone);
        }

        let first = buf
            .first()
            .ok_or_else(|| BatcherError::Transform("empty batch buffer".to_string()))?;

        // The first record locks the batch schema, the key, and the start
        // offset; every later record must match the schema.
        let schema_id = first.schema_id;
        let table = self
            .resolver
            .resolve(&self.topic, schema_id, self.key_schema_id)
            .await?;
        let s3_key = construct_s3_key(
            &self.bucket_dir,
            &self.consumer_group_id,
            &first.topic,
            first.partition,
            first.offset,
            self.mask_version.as_deref(),
        );

        let mut resp = BatchResponse {
            batch_id,
            schema_id,
            s3_key,
            start_offset: first.offset,
            end_offset: first.offset,
            create_events: 0,
            update_events: 0,
            delete_events: 0,
            bytes_processed: 0,
            messages_processed: 0,
            mask_schema: HashMap::new(),
            extra_mask_schema: HashMap::new(),
        };

        let mut body: Vec<u8> = Vec::with_capacity(4096);
        for mut record in buf {
            if token.is_cancelled() {
                return Err(BatcherError::SessionDone);
            }
            if record.schema_id != schema_id {
                return Err(BatcherError::SchemaMismatch {
                    topic: self.topic.clone(),
                    expected: schema_id,
                    got: record.schema_id,
                });
            }

            self.process_record(&mut record, &table, &mut resp, &mut body)?;
        }

        debug!(
            topic = %self.topic,
            batch_id,
            size = resp.messages_processed,
            "uploading"
        );
        let compressed = gzip_body(&body);
        self.sink.upload(&resp.s3_key, Bytes::from(compressed)).await?;
        debug!(
            topic = %self.topic,
            batch_id,
            start_offset = resp.start_offset,
            end_offset = resp.end_offset,
            key = %resp.s3_key,
            "uploaded"
        );
        Ok(resp)
    }

    fn process_record(
        &self,
        record: &mut CdcRecord,
        table: &TableSchema,
        resp: &mut BatchResponse,
        body: &mut Vec<u8>,
    ) -> Result<()> {
        self.transformer.transform(record, table)?;
        if let Some(masker) = &self.masker {
            masker.transform(record, table)?;
        }
        record.remove_empty_null_values();

        let line = serde_json::to_vec(&record.value)?;
        body.extend_from_slice(&line);
        body.push(b'\n');

        resp.bytes_processed += record.bytes;
        match record.operation {
            Operation::Create => resp.create_events += 1,
            Operation::Update => resp.update_events += 1,
            Operation::Delete => resp.delete_events += 1,
        }
        if self.masker.is_some() && resp.mask_schema.is_empty() {
            resp.mask_schema = record.mask_schema.clone();
        }
        if self.masker.is_some() && resp.extra_mask_schema.is_empty() {
            resp.extra_mask_schema = record.extra_mask_schema.clone();
        }
        resp.end_offset = record.offset;
        resp.messages_processed += 1;
        Ok(())
    }

    /// Emit one load job for an uploaded batch.
    async fn signal_load(&self, resp: &BatchResponse) -> Result<()> {
        let job = LoadJob::new(
            &self.topic,
            resp.start_offset,
            resp.end_offset,
            ",",
            self.sink.key_uri(&resp.s3_key),
            resp.schema_id,
            self.key_schema_id,
            resp.mask_schema.clone(),
            resp.extra_mask_schema.clone(),
            resp.bytes_processed,
            resp.create_events,
            resp.update_events,
            resp.delete_events,
        );
        let value = job.to_avro(&self.loader_schema)?;
        self.signaler
            .add(
                &self.loader_topic,
                &self.loader_schema,
                self.loader_schema_id,
                self.next_signal_key(),
                value,
            )
            .await
            .map_err(|e| BatcherError::Signal(e.to_string()))?;
        debug!(topic = %self.topic, batch_id = resp.batch_id, "signalled loader");
        Ok(())
    }

    /// Signal keys sort by wall clock; the sequence suffix keeps them
    /// unique within a millisecond.
    fn next_signal_key(&self) -> Bytes {
        let seq = self.signal_seq.fetch_add(1, Ordering::Relaxed);
        Bytes::from(format!("{}-{}", Utc::now().timestamp_millis(), seq))
    }

    async fn mark_round(&self, session: &Arc<dyn GroupSession>, end_offset: i64) {
        let next = end_offset + 1;
        debug!(topic = %self.topic, offset = next, "marking offset");
        session.mark_offset(&self.topic, self.partition, next).await;
        if !self.auto_commit {
            if let Err(e) = session.commit().await {
                warn!(topic = %self.topic, error = %e, "offset commit failed");
            }
        }
    }

    async fn shutdown_signaler(&self) {
        if let Err(e) = self.signaler.close().await {
            warn!(topic = %self.topic, error = %e, "closing signal producer");
        }
    }

    /// Deliver the round's error unless the session died first.
    async fn report(
        &self,
        token: &CancellationToken,
        errors: &mpsc::Sender<BatcherError>,
        err: BatcherError,
    ) {
        tokio::select! {
            _ = token.cancelled() => {
                debug!(topic = %self.topic, "session context done before error report");
            }
            sent = errors.send(err) => {
                if sent.is_err() {
                    warn!(topic = %self.topic, "error channel closed");
                }
            }
        }
    }
}

/// Mask settings shared by every processor of a consumer group.
pub struct MaskSettings {
    pub salt: String,
    pub file_version: Option<String>,
    pub rules: MaskRules,
}

/// Builds processors for claims as the session assigns them.
///
/// The factory front-loads the registry work: registering the load-job
/// schema under the loader topic's subject and fetching the upstream key
/// schema id the loader uses for primary keys.
pub struct BatchProcessorFactory {
    consumer_group_id: String,
    loader_topic_prefix: String,
    bucket_dir: String,
    auto_commit: bool,
    max_concurrency: usize,
    mask: Option<MaskSettings>,
    sink: Arc<StorageSink>,
    signaler: Arc<AvroProducer>,
    registry: Arc<dyn SchemaRegistry>,
    resolver: Arc<dyn SchemaResolver>,
}

impl BatchProcessorFactory {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        consumer_group_id: &str,
        loader_topic_prefix: &str,
        bucket_dir: &str,
        auto_commit: bool,
        max_concurrency: usize,
        mask: Option<MaskSettings>,
        sink: Arc<StorageSink>,
        signaler: Arc<AvroProducer>,
        registry: Arc<dyn SchemaRegistry>,
        resolver: Arc<dyn SchemaResolver>,
    ) -> Self {
        Self {
            consumer_group_id: consumer_group_id.to_string(),
            loader_topic_prefix: loader_topic_prefix.to_string(),
            bucket_dir: bucket_dir.to_string(),
            auto_commit,
            max_concurrency,
            mask,
            sink,
            signaler,
            registry,
            resolver,
        }
    }

    pub async fn make(&self, topic: &str, partition: i32) -> Result<BatchProcessor> {
        let loader_topic = format!("{}{}", self.loader_topic_prefix, topic);
        let loader_schema = self
            .registry
            .create_schema(&loader_topic, JOB_AVRO_SCHEMA, false)
            .await
            .map_err(|e| {
                BatcherError::Schema(format!("creating schema for {loader_topic}: {e}"))
            })?;
        let key_schema = self
            .registry
            .latest_schema(topic, true, 2)
            .await
            .map_err(|e| BatcherError::Schema(format!("fetching key schema for {topic}: {e}")))?;

        let masker = self
            .mask
            .as_ref()
            .map(|m| Arc::new(Masker::new(&m.salt, topic, &m.rules)));

        BatchProcessor::new(
            BatchProcessorSettings {
                topic: topic.to_string(),
                partition,
                consumer_group_id: self.consumer_group_id.clone(),
                loader_topic_prefix: self.loader_topic_prefix.clone(),
                auto_commit: self.auto_commit,
                bucket_dir: self.bucket_dir.clone(),
                mask_version: self.mask.as_ref().and_then(|m| m.file_version.clone()),
                max_concurrency: self.max_concurrency,
                loader_schema_id: loader_schema.id,
                key_schema_id: key_schema.id,
            },
            Arc::clone(&self.sink),
            Arc::clone(&self.resolver),
            masker,
            Arc::clone(&self.signaler),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn test_construct_s3_key_without_mask_version() {
        let key = construct_s3_key("batches", "g1", "db.orders", 0, 100, None);
        assert_eq!(key, "batches/g1/db.orders/100_offset_0_partition.json.gz");
    }

    #[test]
    fn test_construct_s3_key_with_mask_version() {
        let key = construct_s3_key("batches", "g1", "db.orders", 2, 100, Some("v2"));
        assert_eq!(key, "batches/g1/db.orders/v2/100_offset_2_partition.json.gz");
    }

    #[test]
    fn test_construct_s3_key_empty_mask_version() {
        let key = construct_s3_key("batches", "g1", "db.orders", 0, 100, Some(""));
        assert_eq!(key, "batches/g1/db.orders/100_offset_0_partition.json.gz");
    }

    #[test]
    fn test_construct_s3_key_deterministic() {
        let a = construct_s3_key("d", "g", "t", 3, 42, Some("v1"));
        let b = construct_s3_key("d", "g", "t", 3, 42, Some("v1"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_gzip_body_roundtrip() {
        let body = b"{\"id\":\"1\"}\n{\"id\":\"2\"}\n";
        let compressed = gzip_body(body);
        let mut decoder = GzDecoder::new(&compressed[..]);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).unwrap();
        assert_eq!(decompressed, body);
    }
}
