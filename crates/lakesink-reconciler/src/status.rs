//! Persisted sink status.
//!
//! The status records which group each topic belongs to, the realtime
//! set from the last reconcile, and the loader offsets persisted so an
//! inactive consumer group whose commit aged out of the broker can still
//! release. Status patches are the reconciler's only persisted mutation
//! and are serialized by the single-reconciler guarantee.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ReconcilerError, Result};
use crate::spec::GroupId;

/// Per-topic membership record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicGroup {
    pub id: GroupId,
    /// Loader group's last observed committed offset, kept so that a
    /// group the broker has forgotten is not stuck unreleasable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loader_current_offset: Option<i64>,
}

impl TopicGroup {
    pub fn new(id: GroupId) -> Self {
        Self {
            id,
            loader_current_offset: None,
        }
    }
}

/// The whole persisted status of one sink.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkStatus {
    #[serde(default)]
    pub topic_groups: HashMap<String, TopicGroup>,
    /// Topics flagged realtime by the last calculator run.
    #[serde(default)]
    pub realtime: Vec<String>,
    /// Mask version the current topic-group assignment was computed for.
    #[serde(default)]
    pub mask_version: Option<String>,
}

/// Storage for the status record.
pub trait StatusStore: Send + Sync {
    fn load(&self) -> Result<SinkStatus>;
    fn patch(&self, status: &SinkStatus) -> Result<()>;
}

/// JSON-file-backed status store. A missing file reads as the empty
/// status; writes go through a sibling temp file and a rename.
pub struct FileStatusStore {
    path: PathBuf,
}

impl FileStatusStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl StatusStore for FileStatusStore {
    fn load(&self) -> Result<SinkStatus> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                ReconcilerError::Status(format!("parsing {}: {e}", self.path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SinkStatus::default()),
            Err(e) => Err(ReconcilerError::Status(format!(
                "reading {}: {e}",
                self.path.display()
            ))),
        }
    }

    fn patch(&self, status: &SinkStatus) -> Result<()> {
        let raw = serde_json::to_vec_pretty(status)
            .map_err(|e| ReconcilerError::Status(format!("encoding status: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)
            .map_err(|e| ReconcilerError::Status(format!("writing {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            ReconcilerError::Status(format!("renaming into {}: {e}", self.path.display()))
        })
    }
}
