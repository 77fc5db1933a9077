//! Schema registry client.
//!
//! Subjects follow the `{topic}-value` / `{topic}-key` convention. The
//! HTTP implementation talks to a Confluent-compatible REST API; the
//! trait exists so the transformer and the batch processor can run
//! against an in-memory registry in tests.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{KafkaError, Result};

/// Subject under which a topic's key or value schema is registered.
pub fn subject_name(topic: &str, is_key: bool) -> String {
    if is_key {
        format!("{topic}-key")
    } else {
        format!("{topic}-value")
    }
}

/// A schema as the registry knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredSchema {
    pub id: i32,
    pub version: i32,
    pub schema: String,
}

#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// Register `schema` under the topic's subject. Registries treat this
    /// as idempotent on schema equality, so re-registering an existing
    /// schema returns its existing id.
    async fn create_schema(&self, topic: &str, schema: &str, is_key: bool)
        -> Result<RegisteredSchema>;

    /// Latest schema registered under the topic's subject, retrying
    /// `retries` times on failure.
    async fn latest_schema(&self, topic: &str, is_key: bool, retries: u32)
        -> Result<RegisteredSchema>;

    /// Schema definition for a registry id.
    async fn schema_by_id(&self, id: i32) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    schema: &'a str,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    id: i32,
}

#[derive(Debug, Deserialize)]
struct SubjectVersionResponse {
    id: i32,
    version: i32,
    schema: String,
}

#[derive(Debug, Deserialize)]
struct SchemaByIdResponse {
    schema: String,
}

/// HTTP client for a Confluent-compatible schema registry.
pub struct HttpSchemaRegistry {
    base_url: String,
    client: reqwest::Client,
    retry_backoff: Duration,
}

impl HttpSchemaRegistry {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            retry_backoff: Duration::from_secs(2),
        }
    }

    async fn get_latest(&self, subject: &str) -> Result<RegisteredSchema> {
        let url = format!("{}/subjects/{}/versions/latest", self.base_url, subject);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| KafkaError::Registry(format!("GET {url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(KafkaError::Registry(format!(
                "GET {url}: status {}",
                resp.status()
            )));
        }
        let body: SubjectVersionResponse = resp
            .json()
            .await
            .map_err(|e| KafkaError::Registry(format!("decoding {url}: {e}")))?;
        Ok(RegisteredSchema {
            id: body.id,
            version: body.version,
            schema: body.schema,
        })
    }
}

#[async_trait]
impl SchemaRegistry for HttpSchemaRegistry {
    async fn create_schema(
        &self,
        topic: &str,
        schema: &str,
        is_key: bool,
    ) -> Result<RegisteredSchema> {
        let subject = subject_name(topic, is_key);
        let url = format!("{}/subjects/{}/versions", self.base_url, subject);
        let resp = self
            .client
            .post(&url)
            .json(&RegisterRequest { schema })
            .send()
            .await
            .map_err(|e| KafkaError::Registry(format!("POST {url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(KafkaError::Registry(format!(
                "POST {url}: status {}",
                resp.status()
            )));
        }
        let body: RegisterResponse = resp
            .json()
            .await
            .map_err(|e| KafkaError::Registry(format!("decoding {url}: {e}")))?;

        // The register response carries only the id; the version comes
        // from the subject's latest entry.
        let version = self.get_latest(&subject).await.map(|s| s.version).unwrap_or(1);
        Ok(RegisteredSchema {
            id: body.id,
            version,
            schema: schema.to_string(),
        })
    }

    async fn latest_schema(
        &self,
        topic: &str,
        is_key: bool,
        retries: u32,
    ) -> Result<RegisteredSchema> {
        let subject = subject_name(topic, is_key);
        let mut attempt = 0;
        loop {
            match self.get_latest(&subject).await {
                Ok(schema) => return Ok(schema),
                Err(e) if attempt < retries => {
                    attempt += 1;
                    warn!(
                        subject = %subject,
                        attempt,
                        error = %e,
                        "schema fetch failed, retrying"
                    );
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn schema_by_id(&self, id: i32) -> Result<String> {
        let url = format!("{}/schemas/ids/{id}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| KafkaError::Registry(format!("GET {url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(KafkaError::Registry(format!(
                "GET {url}: status {}",
                resp.status()
            )));
        }
        let body: SchemaByIdResponse = resp
            .json()
            .await
            .map_err(|e| KafkaError::Registry(format!("decoding {url}: {e}")))?;
        Ok(body.schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_name() {
        assert_eq!(subject_name("db.orders", false), "db.orders-value");
        assert_eq!(subject_name("db.orders", true), "db.orders-key");
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let registry = HttpSchemaRegistry::new("http://registry:8081/");
        assert_eq!(registry.base_url, "http://registry:8081");
    }
}
