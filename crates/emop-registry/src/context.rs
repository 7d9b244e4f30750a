//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Meter registry and per-meter access control."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use emop_transport::MeterAddress;
use parking_lot::{Mutex as SyncMutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::debug;

/// Activity state guarded by the meter lock.
#[derive(Debug, Default)]
pub struct MeterActivity {
    last_request: Option<Instant>,
}

/// The meter lock was not obtained in time.
#[derive(Debug, Clone, Error)]
#[error("meter {serial} busy: lock not acquired within {waited:?}")]
pub struct LockTimeout {
    /// Meter whose lock was contended.
    pub serial: String,
    /// How long the caller waited.
    pub waited: Duration,
}

/// Point-in-time view of a meter for info endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MeterSnapshot {
    /// Meter serial number.
    pub serial: String,
    /// Resolved host.
    pub host: String,
    /// Resolved TCP port.
    pub port: u16,
    /// Completion time of the last conversation, if any.
    pub last_request_at: Option<DateTime<Utc>>,
    /// Whether a conversation holds the lock right now.
    pub busy: bool,
}

/// One physical meter.
#[derive(Debug)]
pub struct MeterContext {
    serial: String,
    address: RwLock<MeterAddress>,
    lock: Arc<Mutex<MeterActivity>>,
    // Wall-clock copy of the last completion for snapshots taken while busy.
    last_request_at: Arc<SyncMutex<Option<DateTime<Utc>>>>,
}

impl MeterContext {
    /// Idle meter that has never been contacted.
    pub fn new(serial: impl Into<String>, address: MeterAddress) -> Self {
        Self {
            serial: serial.into(),
            address: RwLock::new(address),
            lock: Arc::new(Mutex::new(MeterActivity::default())),
            last_request_at: Arc::new(SyncMutex::new(None)),
        }
    }

    /// Serial number the context is keyed by.
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Current address.
    pub fn address(&self) -> MeterAddress {
        self.address.read().clone()
    }

    /// Replace the address in place. Returns whether it changed.
    pub(crate) fn set_address(&self, address: MeterAddress) -> bool {
        let mut current = self.address.write();
        if *current == address {
            return false;
        }
        *current = address;
        true
    }

    /// Wait at most `wait` for exclusive access to the meter.
    pub async fn acquire(&self, wait: Duration) -> Result<MeterGuard, LockTimeout> {
        match tokio::time::timeout(wait, self.lock.clone().lock_owned()).await {
            Ok(activity) => Ok(MeterGuard {
                serial: self.serial.clone(),
                activity,
                last_request_at: self.last_request_at.clone(),
            }),
            Err(_) => Err(LockTimeout {
                serial: self.serial.clone(),
                waited: wait,
            }),
        }
    }

    /// Whether a conversation currently holds the lock.
    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    pub fn last_request_at(&self) -> Option<DateTime<Utc>> {
        *self.last_request_at.lock()
    }

    pub fn snapshot(&self) -> MeterSnapshot {
        let address = self.address();
        MeterSnapshot {
            serial: self.serial.clone(),
            host: address.host,
            port: address.port,
            last_request_at: self.last_request_at(),
            busy: self.is_busy(),
        }
    }
}

/// Exclusive access to one meter; released on drop.
#[derive(Debug)]
pub struct MeterGuard {
    serial: String,
    activity: OwnedMutexGuard<MeterActivity>,
    last_request_at: Arc<SyncMutex<Option<DateTime<Utc>>>>,
}

impl MeterGuard {
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Sleep until `min_spacing` has passed since the previous conversation.
    /// Returns the time slept.
    pub async fn space_out(&self, min_spacing: Duration) -> Duration {
        let Some(last) = self.activity.last_request else {
            return Duration::ZERO;
        };
        let elapsed = last.elapsed();
        if elapsed >= min_spacing {
            return Duration::ZERO;
        }
        let wait = min_spacing - elapsed;
        debug!(serial = %self.serial, wait_ms = wait.as_millis() as u64, "spacing out meter request");
        tokio::time::sleep(wait).await;
        wait
    }

    /// Record that a conversation just finished.
    pub fn mark_used(&mut self) {
        self.activity.last_request = Some(Instant::now());
        *self.last_request_at.lock() = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> MeterContext {
        MeterContext::new("EML2137580826", MeterAddress::new("10.8.0.4", 8080))
    }

    #[tokio::test(start_paused = true)]
    async fn first_request_is_not_delayed() {
        let ctx = context();
        let guard = ctx.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(guard.space_out(Duration::from_secs(2)).await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn back_to_back_requests_are_spaced() {
        let ctx = context();
        {
            let mut guard = ctx.acquire(Duration::from_secs(1)).await.unwrap();
            guard.mark_used();
        }
        tokio::time::advance(Duration::from_millis(500)).await;

        let guard = ctx.acquire(Duration::from_secs(1)).await.unwrap();
        let started = Instant::now();
        let slept = guard.space_out(Duration::from_secs(2)).await;
        assert_eq!(slept, Duration::from_millis(1500));
        assert!(started.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_while_held() {
        let ctx = context();
        let _held = ctx.acquire(Duration::from_secs(1)).await.unwrap();
        assert!(ctx.is_busy());

        let started = Instant::now();
        let err = ctx.acquire(Duration::from_secs(60)).await.unwrap_err();
        assert_eq!(err.waited, Duration::from_secs(60));
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn snapshot_reports_busy_and_last_use() {
        let ctx = context();
        assert!(ctx.snapshot().last_request_at.is_none());

        let mut guard = ctx.acquire(Duration::from_secs(1)).await.unwrap();
        guard.mark_used();
        let snapshot = ctx.snapshot();
        assert!(snapshot.busy);
        assert!(snapshot.last_request_at.is_some());
        drop(guard);
        assert!(!ctx.snapshot().busy);
    }

    #[test]
    fn set_address_reports_changes() {
        let ctx = context();
        assert!(!ctx.set_address(MeterAddress::new("10.8.0.4", 8080)));
        assert!(ctx.set_address(MeterAddress::new("10.8.0.9", 8080)));
        assert_eq!(ctx.address().host, "10.8.0.9");
    }
}
