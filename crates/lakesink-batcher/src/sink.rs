//! Object-store sink for staged batches.
//!
//! Thin layer over `object_store`: puts compressed bodies at the keys the
//! processor constructs and renders the `s3://` URIs that travel in
//! load-job signals. The store handle is shared by every batch processor
//! in the process.

use std::sync::Arc;

use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use serde::Serialize;
use tracing::debug;

use crate::config::StoreConfig;
use crate::error::{BatcherError, Result};

/// One entry of an object manifest.
#[derive(Debug, Clone, Serialize)]
pub struct ManifestEntry {
    pub url: String,
    pub mandatory: bool,
}

#[derive(Debug, Serialize)]
struct Manifest<'a> {
    entries: &'a [ManifestEntry],
}

/// Uploads staged batches and renders their URIs.
pub struct StorageSink {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl StorageSink {
    /// S3-backed sink. Credentials fall back to the ambient provider
    /// chain when not set explicitly.
    pub fn new_s3(config: &StoreConfig) -> Result<Self> {
        let mut builder = AmazonS3Builder::from_env()
            .with_region(&config.region)
            .with_bucket_name(&config.bucket);
        if let Some(key_id) = &config.access_key_id {
            builder = builder.with_access_key_id(key_id);
        }
        if let Some(secret) = &config.secret_access_key {
            builder = builder.with_secret_access_key(secret);
        }
        let store = builder
            .build()
            .map_err(|e| BatcherError::Config(format!("building s3 client: {e}")))?;
        Ok(Self {
            store: Arc::new(store),
            bucket: config.bucket.clone(),
        })
    }

    /// Sink over an arbitrary store. Tests pass an in-memory store.
    pub fn with_store(store: Arc<dyn ObjectStore>, bucket: &str) -> Self {
        Self {
            store,
            bucket: bucket.to_string(),
        }
    }

    /// URI of a key as the downstream loader will see it.
    pub fn key_uri(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }

    /// Put `body` at `key`.
    pub async fn upload(&self, key: &str, body: Bytes) -> Result<()> {
        let path = ObjectPath::from(key);
        let len = body.len();
        self.store
            .put(&path, body.into())
            .await
            .map_err(|e| BatcherError::Upload(format!("putting {key}: {e}")))?;
        debug!(key, bytes = len, "uploaded");
        Ok(())
    }

    /// Put a JSON manifest of previously uploaded objects at `key`.
    pub async fn upload_manifest(&self, key: &str, entries: &[ManifestEntry]) -> Result<()> {
        let body = serde_json::to_vec(&Manifest { entries })
            .map_err(|e| BatcherError::Upload(format!("encoding manifest: {e}")))?;
        self.upload(key, Bytes::from(body)).await
    }
}
