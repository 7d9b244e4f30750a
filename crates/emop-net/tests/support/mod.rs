//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Fake meters and lookups shared by mediator tests."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use emop_codec::{Access, DataField, DefaultRecord, Frame};
use emop_net::{MediatorService, MediatorSettings};
use emop_registry::{MeterContext, MeterLookup, MeterSnapshot};
use emop_transport::{FrameSettings, MeterAddress, MeterTransport, TransportError};
use parking_lot::Mutex;
use tokio::time::Instant;

/// One completed exchange: meter host, start and end.
pub type Exchange = (String, Instant, Instant);

/// In-memory meter fleet answering reads with a fixed value.
pub struct FakeMeters {
    pub delay: Duration,
    pub value: Vec<u8>,
    pub fail_with_eof: AtomicBool,
    pub calls: AtomicUsize,
    pub max_per_meter: AtomicUsize,
    pub max_total: AtomicUsize,
    active: Mutex<HashMap<String, usize>>,
    total_active: AtomicUsize,
    pub log: Mutex<Vec<Exchange>>,
}

impl FakeMeters {
    pub fn new(delay: Duration, value: &[u8]) -> Self {
        Self {
            delay,
            value: value.to_vec(),
            fail_with_eof: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            max_per_meter: AtomicUsize::new(0),
            max_total: AtomicUsize::new(0),
            active: Mutex::new(HashMap::new()),
            total_active: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn reply(&self, request: &[u8]) -> Vec<u8> {
        let request = Frame::decode(request).expect("mediator sent a valid frame");
        let data = match request.data {
            DataField::Default(record) if record.access == Access::Read => {
                DataField::Default(DefaultRecord {
                    object_id: record.object_id,
                    access: Access::Read,
                    payload: self.value.clone(),
                })
            }
            other => other,
        };
        Frame {
            control: request.control,
            destination: request.source,
            source: request.destination,
            data,
        }
        .encode()
        .expect("reply encodes")
    }
}

#[async_trait]
impl MeterTransport for FakeMeters {
    async fn exchange(&self, target: &MeterAddress, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        {
            let mut active = self.active.lock();
            let count = active.entry(target.host.clone()).or_insert(0);
            *count += 1;
            self.max_per_meter.fetch_max(*count, Ordering::SeqCst);
        }
        let total = self.total_active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_total.fetch_max(total, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        self.total_active.fetch_sub(1, Ordering::SeqCst);
        if let Some(count) = self.active.lock().get_mut(&target.host) {
            *count -= 1;
        }
        self.log
            .lock()
            .push((target.host.clone(), started, Instant::now()));

        if self.fail_with_eof.load(Ordering::SeqCst) {
            return Err(TransportError::ProtocolEof);
        }
        Ok(self.reply(request))
    }
}

/// Fixed serial to context map.
pub struct FixedLookup {
    meters: HashMap<String, Arc<MeterContext>>,
}

impl FixedLookup {
    pub fn new(serials: &[&str]) -> Self {
        let meters = serials
            .iter()
            .enumerate()
            .map(|(index, serial)| {
                let address = MeterAddress::new(format!("10.0.0.{}", index + 1), 8080);
                (serial.to_string(), Arc::new(MeterContext::new(*serial, address)))
            })
            .collect();
        Self { meters }
    }

    pub fn context(&self, serial: &str) -> Arc<MeterContext> {
        self.meters[serial].clone()
    }
}

#[async_trait]
impl MeterLookup for FixedLookup {
    async fn lookup(&self, serial: &str) -> Option<Arc<MeterContext>> {
        self.meters.get(serial).cloned()
    }

    fn snapshot(&self) -> Vec<MeterSnapshot> {
        let mut meters: Vec<_> = self.meters.values().map(|meter| meter.snapshot()).collect();
        meters.sort_by(|a, b| a.serial.cmp(&b.serial));
        meters
    }
}

pub fn settings(lock_timeout: Duration, min_spacing: Duration) -> MediatorSettings {
    MediatorSettings {
        lock_timeout,
        min_spacing,
        rpc_deadline: None,
        frame: FrameSettings::default(),
    }
}

pub fn mediator(
    lookup: Arc<FixedLookup>,
    meters: Arc<FakeMeters>,
    settings: MediatorSettings,
) -> MediatorService {
    MediatorService::new(lookup, meters, settings)
}
