//! Core data model for lakesink.
//!
//! This crate defines the types shared by the batcher and the reconciler:
//! the decoded CDC record, the mask metadata attached to it, and the
//! load-job signal sent to the downstream loader. It carries no I/O;
//! everything network-facing lives in `lakesink-kafka` and the two
//! service crates.

pub mod error;
pub mod job;
pub mod record;

pub use error::{CoreError, Result};
pub use job::{LoadJob, JOB_AVRO_SCHEMA};
pub use record::{CdcRecord, ExtraMaskInfo, MaskInfo, Operation};
