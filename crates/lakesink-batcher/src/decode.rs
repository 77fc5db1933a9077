//! Decoding of upstream CDC envelopes.
//!
//! The wire format belongs to the upstream CDC source; this decoder
//! handles its JSON envelope rendering, which is what the source emits
//! when registry-framed Avro is turned off. Swapping in a different
//! format means implementing [`RecordDecoder`] and passing it to the
//! consumer group.

use std::collections::HashMap;

use serde::Deserialize;

use lakesink_core::{CdcRecord, ExtraMaskInfo, MaskInfo, Operation};
use lakesink_kafka::{KafkaError, RecordDecoder};

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "schemaId")]
    schema_id: i32,
    operation: String,
    #[serde(default)]
    key: HashMap<String, String>,
    value: HashMap<String, Option<String>>,
    #[serde(default, rename = "maskSchema")]
    mask_schema: HashMap<String, MaskInfo>,
    #[serde(default, rename = "extraMaskSchema")]
    extra_mask_schema: HashMap<String, ExtraMaskInfo>,
}

/// Decoder for the JSON envelope rendering of CDC events.
pub struct JsonEnvelopeDecoder;

impl RecordDecoder for JsonEnvelopeDecoder {
    fn decode(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        _key: Option<&[u8]>,
        payload: &[u8],
    ) -> lakesink_kafka::Result<Option<CdcRecord>> {
        let envelope: Envelope = serde_json::from_slice(payload).map_err(|e| {
            KafkaError::Serialization(format!("decoding envelope at {topic}/{partition}@{offset}: {e}"))
        })?;
        let operation = Operation::from_tag(&envelope.operation)?;

        Ok(Some(CdcRecord {
            topic: topic.to_string(),
            partition,
            offset,
            schema_id: envelope.schema_id,
            operation,
            key: envelope.key,
            value: envelope.value,
            mask_schema: envelope.mask_schema,
            extra_mask_schema: envelope.extra_mask_schema,
            bytes: payload.len() as i64,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_envelope() {
        let payload = br#"{
            "schemaId": 7,
            "operation": "c",
            "key": {"id": "1"},
            "value": {"id": "1", "email": "a@b.com", "note": null}
        }"#;
        let record = JsonEnvelopeDecoder
            .decode("db.orders", 0, 100, None, payload)
            .unwrap()
            .unwrap();

        assert_eq!(record.schema_id, 7);
        assert_eq!(record.operation, Operation::Create);
        assert_eq!(record.offset, 100);
        assert_eq!(record.value["email"].as_deref(), Some("a@b.com"));
        assert_eq!(record.value["note"], None);
        assert_eq!(record.bytes, payload.len() as i64);
    }

    #[test]
    fn test_decode_rejects_unknown_operation() {
        let payload = br#"{"schemaId": 1, "operation": "x", "value": {}}"#;
        assert!(JsonEnvelopeDecoder
            .decode("db.orders", 0, 0, None, payload)
            .is_err());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(JsonEnvelopeDecoder
            .decode("db.orders", 0, 0, None, b"not json")
            .is_err());
    }
}
