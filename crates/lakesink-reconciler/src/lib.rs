//! lakesink reconciler.
//!
//! Supervises the blue/green reloading strategy: when the mask version
//! changes, topics move from the main group to a reload group that
//! rebuilds them against the new version while a transient duplicate
//! keeps serving the old one. The realtime calculator watches batcher
//! and loader lag per reloading topic; topics that catch up are promoted
//! back to main, topic by topic.

pub mod config;
pub mod deploy;
pub mod error;
pub mod realtime;
pub mod reconcile;
pub mod spec;
pub mod status;

pub use config::ReconcilerConfig;
pub use deploy::{GroupDeployer, LogOnlyDeployer};
pub use error::{ReconcilerError, Result};
pub use realtime::{OffsetPosition, RealtimeCalculator, RealtimeInfo, RealtimeResult};
pub use reconcile::SinkGroupReconciler;
pub use spec::{
    GroupId, ReleaseCondition, SinkGroupSpec, SinkSpec, DEFAULT_MAX_BATCHER_LAG,
    DEFAULT_MAX_LOADER_LAG,
};
pub use status::{FileStatusStore, SinkStatus, StatusStore, TopicGroup};
