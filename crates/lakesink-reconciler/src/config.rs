//! Reconciler configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{ReconcilerError, Result};
use crate::spec::SinkSpec;

/// Broker connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    pub brokers: String,
}

/// Top-level reconciler configuration: the broker connection, where the
/// status record lives, and the sink specs to supervise.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconcilerConfig {
    pub kafka: KafkaConfig,
    /// Directory holding one status file per sink.
    pub status_dir: PathBuf,
    pub sinks: Vec<SinkSpec>,
}

impl ReconcilerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ReconcilerError::Config(format!("reading {}: {e}", path.display())))?;
        let config: ReconcilerConfig = serde_yaml::from_str(&raw)
            .map_err(|e| ReconcilerError::Config(format!("parsing {}: {e}", path.display())))?;
        if config.sinks.is_empty() {
            return Err(ReconcilerError::Config(
                "at least one sink is required".to_string(),
            ));
        }
        Ok(config)
    }

    /// Status file path for one sink.
    pub fn status_path(&self, spec: &SinkSpec) -> PathBuf {
        self.status_dir
            .join(format!("{}-{}.json", spec.name, spec.namespace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
kafka:
  brokers: "broker-0:9092"
status_dir: "/var/lib/lakesink"
sinks:
  - name: "orders-sink"
    namespace: "data"
    kafka_topic_regexes: "^db\\."
    kafka_loader_topic_prefix: "loader-"
    release_condition:
      max_batcher_lag: 100
      max_loader_lag: 10
"#;

    #[test]
    fn test_load_sample() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = ReconcilerConfig::load(file.path()).unwrap();
        assert_eq!(config.sinks.len(), 1);
        let sink = &config.sinks[0];
        assert_eq!(sink.name, "orders-sink");
        assert_eq!(
            config.status_path(sink),
            PathBuf::from("/var/lib/lakesink/orders-sink-data.json")
        );
        assert_eq!(sink.max_lag("db.orders"), (100, 10));
    }

    #[test]
    fn test_empty_sinks_rejected() {
        let raw = "kafka:\n  brokers: \"b:9092\"\nstatus_dir: \"/tmp\"\nsinks: []\n";
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(raw.as_bytes()).unwrap();
        assert!(ReconcilerConfig::load(file.path()).is_err());
    }
}
