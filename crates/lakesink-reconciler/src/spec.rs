//! The declarative sink specification.
//!
//! A sink names the topics it covers (by regex), the loader topic
//! prefix, and the lag thresholds under which a reloading topic counts
//! as realtime. Thresholds resolve per-topic first, then sink-wide,
//! then built-in defaults.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A reloading topic's batcher lag must sit within this for release
/// unless configured otherwise.
pub const DEFAULT_MAX_BATCHER_LAG: i64 = 100;

/// Loader-side counterpart of [`DEFAULT_MAX_BATCHER_LAG`].
pub const DEFAULT_MAX_LOADER_LAG: i64 = 10;

/// Lag thresholds gating promotion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseCondition {
    pub max_batcher_lag: Option<i64>,
    pub max_loader_lag: Option<i64>,
}

/// The three deployment groups of one sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupId {
    /// Serves currently-live topics.
    Main,
    /// Rebuilds topics against the new schema version.
    Reload,
    /// Transient duplicate serving the old schema until promotion.
    ReloadDupe,
}

impl GroupId {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupId::Main => "main",
            GroupId::Reload => "reload",
            GroupId::ReloadDupe => "reloadDupe",
        }
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Desired state for one deployment group, handed to the deployer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkGroupSpec {
    pub group: GroupId,
    pub topics: Vec<String>,
    pub mask_file_version: Option<String>,
}

/// One sink as declared by the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkSpec {
    pub name: String,
    pub namespace: String,
    /// Comma-separated regexes selecting the sink's topics.
    pub kafka_topic_regexes: String,
    pub kafka_loader_topic_prefix: String,
    #[serde(default)]
    pub release_condition: Option<ReleaseCondition>,
    #[serde(default)]
    pub topic_release_condition: HashMap<String, ReleaseCondition>,
    /// Version of the mask rules; a change triggers a reload.
    #[serde(default)]
    pub mask_file_version: Option<String>,
}

impl SinkSpec {
    /// (max batcher lag, max loader lag) for a topic, resolved
    /// per-topic first, then sink-wide, then defaults.
    pub fn max_lag(&self, topic: &str) -> (i64, i64) {
        let mut batcher = DEFAULT_MAX_BATCHER_LAG;
        let mut loader = DEFAULT_MAX_LOADER_LAG;

        if let Some(global) = &self.release_condition {
            if let Some(lag) = global.max_batcher_lag {
                batcher = lag;
            }
            if let Some(lag) = global.max_loader_lag {
                loader = lag;
            }
        }
        if let Some(per_topic) = self.topic_release_condition.get(topic) {
            if let Some(lag) = per_topic.max_batcher_lag {
                batcher = lag;
            }
            if let Some(lag) = per_topic.max_loader_lag {
                loader = lag;
            }
        }
        (batcher, loader)
    }

    /// Loader topic paired with a (group, topic).
    pub fn loader_topic(&self, group: GroupId, topic: &str) -> String {
        format!("{}{}-{}", self.kafka_loader_topic_prefix, group.as_str(), topic)
    }
}
