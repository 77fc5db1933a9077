//! Batcher configuration.
//!
//! Loaded from a YAML file passed via `--config`. One batcher process can
//! run several consumer groups, each with its own regex set and batching
//! knobs; the object store, schema registry, and masking sections are
//! shared.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{BatcherError, Result};

fn default_max_size() -> usize {
    1000
}

fn default_max_wait_seconds() -> u64 {
    30
}

fn default_auto_commit() -> bool {
    true
}

fn default_max_concurrency() -> usize {
    10
}

fn default_topic_refresh_seconds() -> u64 {
    15
}

/// Broker connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    pub brokers: String,
}

/// One consumer group to run.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    pub group_id: String,
    /// Comma-separated regexes selecting this group's topics.
    pub topic_regexes: String,
    /// Records per pre-cut buffer.
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Seconds before a partial buffer is cut anyway.
    #[serde(default = "default_max_wait_seconds")]
    pub max_wait_seconds: u64,
    #[serde(default = "default_auto_commit")]
    pub auto_commit: bool,
}

/// Object store settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub region: String,
    pub bucket: String,
    /// Key prefix under which staged batches are written.
    pub bucket_dir: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

/// Masking settings. Masking is active only when `enabled` is true and a
/// rules file is configured.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MaskConfig {
    #[serde(default)]
    pub enabled: bool,
    pub rules_file: Option<String>,
    #[serde(default)]
    pub salt: String,
    /// When set, becomes a key segment of every staged object.
    pub file_version: Option<String>,
}

/// Top-level batcher configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BatcherConfig {
    pub kafka: KafkaConfig,
    pub consumer_groups: Vec<GroupConfig>,
    pub store: StoreConfig,
    pub schema_registry_url: String,
    pub loader_topic_prefix: String,
    /// In-flight uploads per processor round.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_topic_refresh_seconds")]
    pub topic_refresh_seconds: u64,
    #[serde(default)]
    pub mask: MaskConfig,
}

impl BatcherConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BatcherError::Config(format!("reading {}: {e}", path.display()))
        })?;
        let config: BatcherConfig = serde_yaml::from_str(&raw)
            .map_err(|e| BatcherError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.consumer_groups.is_empty() {
            return Err(BatcherError::Config(
                "at least one consumer group is required".to_string(),
            ));
        }
        let mut seen: HashMap<&str, ()> = HashMap::new();
        for group in &self.consumer_groups {
            if seen.insert(group.group_id.as_str(), ()).is_some() {
                return Err(BatcherError::Config(format!(
                    "duplicate consumer group id: {}",
                    group.group_id
                )));
            }
        }
        if self.mask.enabled && self.mask.rules_file.is_none() {
            return Err(BatcherError::Config(
                "mask.enabled requires mask.rules_file".to_string(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(BatcherError::Config(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
kafka:
  brokers: "broker-0:9092,broker-1:9092"
consumer_groups:
  - group_id: "orders-sink-data-main-batcher"
    topic_regexes: "^db\\.inventory\\."
    max_size: 500
store:
  region: "us-east-1"
  bucket: "cdc-stage"
  bucket_dir: "batches"
schema_registry_url: "http://registry:8081"
loader_topic_prefix: "loader-"
"#;

    #[test]
    fn test_load_sample() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = BatcherConfig::load(file.path()).unwrap();
        assert_eq!(config.consumer_groups.len(), 1);
        assert_eq!(config.consumer_groups[0].max_size, 500);
        // defaults
        assert_eq!(config.consumer_groups[0].max_wait_seconds, 30);
        assert!(config.consumer_groups[0].auto_commit);
        assert_eq!(config.max_concurrency, 10);
        assert!(!config.mask.enabled);
    }

    #[test]
    fn test_mask_requires_rules_file() {
        let raw = SAMPLE.to_string() + "mask:\n  enabled: true\n";
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(raw.as_bytes()).unwrap();

        let err = BatcherConfig::load(file.path()).unwrap_err();
        assert!(format!("{err}").contains("rules_file"));
    }

    #[test]
    fn test_duplicate_groups_rejected() {
        let config: BatcherConfig = serde_yaml::from_str(SAMPLE).unwrap();
        let mut dup = config.clone();
        dup.consumer_groups.push(config.consumer_groups[0].clone());
        assert!(dup.validate().is_err());
    }
}
