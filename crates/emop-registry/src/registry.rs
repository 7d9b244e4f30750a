//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Meter registry and per-meter access control."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use emop_common::RegistryConfig;
use emop_metrics::RegistryMetrics;
use emop_transport::MeterAddress;
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, info};

use crate::context::{MeterContext, MeterSnapshot};
use crate::source::MetadataSource;
use crate::{MeterLookup, RegistryError};

/// Outcome of one successful refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefreshSummary {
    /// Serials seen for the first time.
    pub added: usize,
    /// Known serials whose address changed.
    pub updated: usize,
    /// Meters known after the refresh.
    pub total: usize,
}

/// Serial → meter mapping with lazy, cadence-bounded refresh.
///
/// The mapping lock is only ever held for short synchronous sections and
/// never while a meter lock is held.
pub struct MeterRegistry {
    meters: RwLock<HashMap<String, Arc<MeterContext>>>,
    source: Arc<dyn MetadataSource>,
    refresh_interval: Duration,
    default_port: u16,
    last_refresh: SyncMutex<Option<Instant>>,
    // Serializes refreshes so concurrent stale lookups share one fetch.
    refresh_gate: Mutex<()>,
    metrics: Option<RegistryMetrics>,
}

impl MeterRegistry {
    pub fn new(source: Arc<dyn MetadataSource>, refresh_interval: Duration, default_port: u16) -> Self {
        Self {
            meters: RwLock::new(HashMap::new()),
            source,
            refresh_interval,
            default_port,
            last_refresh: SyncMutex::new(None),
            refresh_gate: Mutex::new(()),
            metrics: None,
        }
    }

    pub fn from_config(
        source: Arc<dyn MetadataSource>,
        config: &RegistryConfig,
        default_port: u16,
    ) -> Self {
        Self::new(source, config.refresh_interval, default_port)
    }

    pub fn with_metrics(mut self, metrics: RegistryMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn len(&self) -> usize {
        self.meters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.meters.read().is_empty()
    }

    fn is_stale(&self) -> bool {
        match *self.last_refresh.lock() {
            None => true,
            Some(at) => at.elapsed() > self.refresh_interval,
        }
    }

    /// Resolve a serial, refreshing first when the mapping is stale.
    pub async fn lookup(&self, serial: &str) -> Option<Arc<MeterContext>> {
        if self.is_stale() {
            self.refresh_if_stale().await;
        }
        self.meters.read().get(serial).cloned()
    }

    async fn refresh_if_stale(&self) {
        let _gate = self.refresh_gate.lock().await;
        // Another caller may have refreshed while this one waited.
        if !self.is_stale() {
            return;
        }
        let _ = self.refresh_locked().await;
    }

    /// Fetch from the source and merge into the mapping.
    ///
    /// On failure the mapping and the refresh timestamp are left as they
    /// were, so the next lookup tries again.
    pub async fn refresh(&self) -> Result<RefreshSummary, RegistryError> {
        let _gate = self.refresh_gate.lock().await;
        self.refresh_locked().await
    }

    async fn refresh_locked(&self) -> Result<RefreshSummary, RegistryError> {
        info!(source = self.source.name(), "refreshing meter registry");
        let records = match self.source.fetch().await {
            Ok(records) => records,
            Err(err) => {
                error!(source = self.source.name(), error = %err, "failed to refresh meter registry");
                if let Some(metrics) = &self.metrics {
                    metrics.record_refresh(false);
                }
                return Err(err);
            }
        };

        let mut summary = RefreshSummary::default();
        {
            let mut meters = self.meters.write();
            for record in records {
                let (Some(serial), Some(host)) = (record.serial, record.host) else {
                    continue;
                };
                if serial.is_empty() || host.is_empty() {
                    continue;
                }
                let address = MeterAddress::new(host, record.port.unwrap_or(self.default_port));
                match meters.get(&serial) {
                    Some(existing) => {
                        if existing.set_address(address.clone()) {
                            info!(serial = %serial, address = %address, "updating meter address");
                            summary.updated += 1;
                        }
                    }
                    None => {
                        info!(serial = %serial, address = %address, "adding meter");
                        meters.insert(serial.clone(), Arc::new(MeterContext::new(serial, address)));
                        summary.added += 1;
                    }
                }
            }
            summary.total = meters.len();
        }
        *self.last_refresh.lock() = Some(Instant::now());

        if summary.added > 0 || summary.updated > 0 {
            info!(
                added = summary.added,
                updated = summary.updated,
                total = summary.total,
                "registry refreshed"
            );
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_refresh(true);
            metrics.set_meter_count(summary.total);
        }
        Ok(summary)
    }

    /// View of every meter without waiting on any meter lock.
    pub fn snapshot(&self) -> Vec<MeterSnapshot> {
        let contexts: Vec<Arc<MeterContext>> = self.meters.read().values().cloned().collect();
        let mut snapshots: Vec<MeterSnapshot> =
            contexts.iter().map(|context| context.snapshot()).collect();
        snapshots.sort_by(|a, b| a.serial.cmp(&b.serial));
        snapshots
    }
}

#[async_trait]
impl MeterLookup for MeterRegistry {
    async fn lookup(&self, serial: &str) -> Option<Arc<MeterContext>> {
        MeterRegistry::lookup(self, serial).await
    }

    fn snapshot(&self) -> Vec<MeterSnapshot> {
        MeterRegistry::snapshot(self)
    }
}
