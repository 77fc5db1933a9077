//! The Avro signal producer.
//!
//! Load-job signals go onto the loader topic as schema-id-framed Avro:
//! a magic byte, the big-endian registry id of the value schema, then the
//! Avro datum. [`AvroProducer`] does the encoding and framing;
//! transport is behind the [`RecordProducer`] trait so tests can capture
//! the wire bytes in memory.

use std::sync::Arc;
use std::time::Duration;

use apache_avro::types::Value as AvroValue;
use apache_avro::{to_avro_datum, Schema};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tracing::debug;

use crate::error::{KafkaError, Result};

/// Framing byte in front of every schema-id-tagged payload.
const MAGIC_BYTE: u8 = 0x00;

/// Frame an encoded datum with the magic byte and its schema id.
///
/// Layout: `[magic(1)][schema_id(4, big-endian)][datum(N)]`.
pub fn frame_with_schema_id(schema_id: i32, datum: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + 4 + datum.len());
    buf.put_u8(MAGIC_BYTE);
    buf.put_i32(schema_id);
    buf.put_slice(datum);
    buf.freeze()
}

/// Raw record transport into the bus.
#[async_trait]
pub trait RecordProducer: Send + Sync {
    async fn send(&self, topic: &str, key: Bytes, payload: Bytes) -> Result<()>;

    /// Flush in-flight records. Called once on shutdown.
    async fn close(&self) -> Result<()>;
}

/// Broker-backed [`RecordProducer`].
pub struct KafkaRecordProducer {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaRecordProducer {
    pub fn new(brokers: &str) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "30000")
            .set("acks", "all")
            .create()
            .map_err(|e| KafkaError::Produce(format!("creating producer: {e}")))?;
        Ok(Self {
            producer,
            send_timeout: Duration::from_secs(30),
        })
    }
}

#[async_trait]
impl RecordProducer for KafkaRecordProducer {
    async fn send(&self, topic: &str, key: Bytes, payload: Bytes) -> Result<()> {
        let record = FutureRecord::to(topic).key(key.as_ref()).payload(payload.as_ref());
        self.producer
            .send(record, self.send_timeout)
            .await
            .map_err(|(e, _)| KafkaError::Produce(format!("sending to {topic}: {e}")))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(Duration::from_secs(30)))
            .await
            .map_err(|e| KafkaError::Produce(format!("flush task: {e}")))?
            .map_err(|e| KafkaError::Produce(format!("flushing producer: {e}")))?;
        Ok(())
    }
}

/// Publishes Avro records under a registered schema id.
pub struct AvroProducer {
    inner: Arc<dyn RecordProducer>,
}

impl AvroProducer {
    pub fn new(inner: Arc<dyn RecordProducer>) -> Self {
        Self { inner }
    }

    /// Encode `value` under `schema`, frame it with `schema_id`, and send
    /// it keyed by `key`.
    pub async fn add(
        &self,
        topic: &str,
        schema: &Schema,
        schema_id: i32,
        key: Bytes,
        value: AvroValue,
    ) -> Result<()> {
        let datum = to_avro_datum(schema, value)?;
        let payload = frame_with_schema_id(schema_id, &datum);
        debug!(topic, schema_id, bytes = payload.len(), "producing avro record");
        self.inner.send(topic, key, payload).await
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CapturingProducer {
        sent: Mutex<Vec<(String, Bytes, Bytes)>>,
    }

    #[async_trait]
    impl RecordProducer for CapturingProducer {
        async fn send(&self, topic: &str, key: Bytes, payload: Bytes) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((topic.to_string(), key, payload));
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_frame_layout() {
        let framed = frame_with_schema_id(123, b"payload");
        assert_eq!(framed[0], MAGIC_BYTE);
        assert_eq!(i32::from_be_bytes([framed[1], framed[2], framed[3], framed[4]]), 123);
        assert_eq!(&framed[5..], b"payload");
    }

    #[test]
    fn test_frame_negative_id() {
        let framed = frame_with_schema_id(-1, b"");
        assert_eq!(framed.len(), 5);
        assert_eq!(i32::from_be_bytes([framed[1], framed[2], framed[3], framed[4]]), -1);
    }

    #[tokio::test]
    async fn test_add_frames_and_sends() {
        let schema = Schema::parse_str(r#"{"type": "string"}"#).unwrap();
        let capture = Arc::new(CapturingProducer {
            sent: Mutex::new(Vec::new()),
        });
        let producer = AvroProducer::new(Arc::clone(&capture) as Arc<dyn RecordProducer>);

        producer
            .add(
                "loader-orders",
                &schema,
                9,
                Bytes::from_static(b"1700000000-0"),
                AvroValue::String("hello".to_string()),
            )
            .await
            .unwrap();

        let sent = capture.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (topic, key, payload) = &sent[0];
        assert_eq!(topic, "loader-orders");
        assert_eq!(key.as_ref(), b"1700000000-0");
        assert_eq!(payload[0], MAGIC_BYTE);
        assert_eq!(
            i32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]),
            9
        );

        let datum = apache_avro::from_avro_datum(&schema, &mut &payload[5..], None).unwrap();
        assert_eq!(datum, AvroValue::String("hello".to_string()));
    }
}
