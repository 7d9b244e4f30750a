//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Meter registry and per-meter access control."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Registry of known meters.
//!
//! Each meter gets one [`MeterContext`] holding its current address and
//! the lock that serializes conversations with it. Contexts are created on
//! first sight and never removed, so the lock a caller holds stays valid
//! across refreshes.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub mod context;
pub mod registry;
pub mod source;

pub use context::{LockTimeout, MeterContext, MeterGuard, MeterSnapshot};
pub use registry::{MeterRegistry, RefreshSummary};
pub use source::{
    source_from_config, MeterRecord, MetadataSource, RestMetadataSource, StaticMetadataSource,
};

/// Metadata source failures.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("metadata source failed: {0}")]
    Source(String),
    #[error("no ESCO matches code '{0}'")]
    EscoNotFound(String),
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        RegistryError::Source(err.to_string())
    }
}

/// Serial resolution as seen by the mediator.
#[async_trait]
pub trait MeterLookup: Send + Sync {
    /// Resolve a serial, refreshing first if the mapping is stale.
    async fn lookup(&self, serial: &str) -> Option<Arc<MeterContext>>;

    /// Non-blocking view of every known meter, ordered by serial.
    fn snapshot(&self) -> Vec<MeterSnapshot>;
}
