//! Deployment seam.
//!
//! Rolling out batcher/loader deployments, config maps, and secrets for
//! a sink group belongs to the surrounding platform; the reconciler only
//! computes desired state and hands it across this trait.

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;
use crate::spec::{SinkGroupSpec, SinkSpec};

#[async_trait]
pub trait GroupDeployer: Send + Sync {
    /// Bring the group's deployment in line with `group`.
    async fn reconcile(&self, sink: &SinkSpec, group: &SinkGroupSpec) -> Result<()>;
}

/// Deployer that only records desired state in the log. Useful when the
/// actual rollout is driven elsewhere.
pub struct LogOnlyDeployer;

#[async_trait]
impl GroupDeployer for LogOnlyDeployer {
    async fn reconcile(&self, sink: &SinkSpec, group: &SinkGroupSpec) -> Result<()> {
        info!(
            sink = %sink.name,
            group = %group.group,
            topics = group.topics.len(),
            mask_version = group.mask_file_version.as_deref().unwrap_or("-"),
            "desired group state"
        );
        Ok(())
    }
}
