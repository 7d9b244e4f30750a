//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Mediator service core."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Request mediation independent of the RPC framework.
//!
//! Every operation resolves the serial, takes the meter lock with a bounded
//! wait and then hands the guard to a spawned conversation task. The task
//! spaces out, talks to the meter, records completion and releases the
//! lock; a caller that gives up early never cuts a conversation short.

use std::sync::Arc;
use std::time::Duration;

use emop_codec::{DataField, ObjectId, MAX_DATA_FIELD_LEN};
use emop_common::MediatorConfig;
use emop_metrics::MediatorMetrics;
use emop_registry::{MeterContext, MeterGuard, MeterLookup};
use emop_transport::{FailureKind, FrameSettings, MeterError, MeterSession, MeterTransport};
use serde_json::json;
use thiserror::Error;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// Default data field overhead: tag, object id and access flag.
const DEFAULT_RECORD_OVERHEAD: usize = 5;

/// Failures surfaced to RPC callers.
#[derive(Debug, Error)]
pub enum MediatorError {
    /// The request failed validation before any meter was touched.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Serial not present in the registry.
    #[error("meter '{0}' not known")]
    NotFound(String),
    /// The meter lock was not obtained within the lock timeout.
    #[error("meter {serial} is busy (lock not acquired within {waited:?})")]
    Busy {
        /// Meter whose lock was contended.
        serial: String,
        /// Time spent waiting.
        waited: Duration,
    },
    /// The server-side RPC deadline passed.
    #[error("deadline exceeded for meter {serial}")]
    DeadlineExceeded {
        /// Meter the request was for.
        serial: String,
    },
    /// The conversation with the meter failed.
    #[error("meter {serial}: {source}")]
    Meter {
        /// Meter the request was for.
        serial: String,
        /// Transport or codec failure.
        source: MeterError,
    },
    /// Failure inside the mediator itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl MediatorError {
    /// Label used for the request outcome metric.
    pub fn outcome(&self) -> &'static str {
        match self {
            MediatorError::InvalidArgument(_) => "invalid_argument",
            MediatorError::NotFound(_) => "not_found",
            MediatorError::Busy { .. } => "busy",
            MediatorError::DeadlineExceeded { .. } => "deadline_exceeded",
            MediatorError::Meter { source, .. } => source.kind().as_str(),
            MediatorError::Internal(_) => "internal",
        }
    }
}

/// Mediated operation names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// `ReadElement` RPC.
    ReadElement,
    /// `WriteElement` RPC.
    WriteElement,
    /// `SendRawMessage` RPC.
    SendRawMessage,
}

impl Operation {
    /// Label used in logs and metrics.
    pub const fn as_str(self) -> &'static str {
        match self {
            Operation::ReadElement => "read_element",
            Operation::WriteElement => "write_element",
            Operation::SendRawMessage => "send_raw_message",
        }
    }
}

enum MeterRequest {
    Read(ObjectId),
    Write(ObjectId, Vec<u8>),
    Raw(Vec<u8>),
}

impl MeterRequest {
    fn operation(&self) -> Operation {
        match self {
            MeterRequest::Read(_) => Operation::ReadElement,
            MeterRequest::Write(..) => Operation::WriteElement,
            MeterRequest::Raw(_) => Operation::SendRawMessage,
        }
    }

    async fn run(self, session: &MeterSession) -> Result<Vec<u8>, MeterError> {
        match self {
            MeterRequest::Read(object_id) => session.read_element(object_id).await,
            MeterRequest::Write(object_id, payload) => session
                .write_element(object_id, &payload)
                .await
                .map(|()| Vec::new()),
            MeterRequest::Raw(data_field) => session.send_raw_message(&data_field).await,
        }
    }
}

/// Access policy applied to every mediated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediatorSettings {
    /// Longest wait for a meter lock.
    pub lock_timeout: Duration,
    /// Quiet period enforced between conversations with one meter.
    pub min_spacing: Duration,
    /// Server-side bound on a whole RPC; `None` leaves it to the client.
    pub rpc_deadline: Option<Duration>,
    /// Envelope for outgoing frames.
    pub frame: FrameSettings,
}

impl Default for MediatorSettings {
    fn default() -> Self {
        Self::from_config(&MediatorConfig::default())
    }
}

impl MediatorSettings {
    pub fn from_config(config: &MediatorConfig) -> Self {
        Self {
            lock_timeout: config.access.lock_timeout,
            min_spacing: config.access.min_spacing,
            rpc_deadline: config.server.rpc_deadline,
            frame: FrameSettings::from_config(&config.meter),
        }
    }
}

/// Serializes and rate-limits access to each meter.
#[derive(Clone)]
pub struct MediatorService {
    lookup: Arc<dyn MeterLookup>,
    transport: Arc<dyn MeterTransport>,
    settings: MediatorSettings,
    metrics: Option<MediatorMetrics>,
}

impl MediatorService {
    pub fn new(
        lookup: Arc<dyn MeterLookup>,
        transport: Arc<dyn MeterTransport>,
        settings: MediatorSettings,
    ) -> Self {
        Self {
            lookup,
            transport,
            settings,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MediatorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn settings(&self) -> &MediatorSettings {
        &self.settings
    }

    /// Read a register and return its raw bytes.
    pub async fn read_element(&self, serial: &str, object_id: u32) -> Result<Vec<u8>, MediatorError> {
        let request = validate_serial(serial)
            .and_then(|()| parse_object_id(object_id))
            .map(MeterRequest::Read);
        self.dispatch(Operation::ReadElement, serial, request).await
    }

    /// Write a register.
    pub async fn write_element(
        &self,
        serial: &str,
        object_id: u32,
        payload: Vec<u8>,
    ) -> Result<(), MediatorError> {
        let request = validate_serial(serial).and_then(|()| {
            let object_id = parse_object_id(object_id)?;
            if payload.len() > MAX_DATA_FIELD_LEN - DEFAULT_RECORD_OVERHEAD {
                return Err(MediatorError::InvalidArgument(format!(
                    "payload of {} bytes does not fit in one frame",
                    payload.len()
                )));
            }
            Ok(MeterRequest::Write(object_id, payload))
        });
        self.dispatch(Operation::WriteElement, serial, request)
            .await
            .map(|_| ())
    }

    /// Forward a caller-encoded data field and return the reply payload.
    pub async fn send_raw_message(
        &self,
        serial: &str,
        data_field: Vec<u8>,
    ) -> Result<Vec<u8>, MediatorError> {
        let request = validate_serial(serial).and_then(|()| {
            if data_field.len() > MAX_DATA_FIELD_LEN {
                return Err(MediatorError::InvalidArgument(format!(
                    "data field of {} bytes does not fit in one frame",
                    data_field.len()
                )));
            }
            DataField::decode(&data_field)
                .map_err(|err| MediatorError::InvalidArgument(format!("invalid data field: {err}")))?;
            Ok(MeterRequest::Raw(data_field))
        });
        self.dispatch(Operation::SendRawMessage, serial, request).await
    }

    /// Registry view of one meter as a JSON document.
    pub async fn meter_info(&self, serial: &str) -> Result<String, MediatorError> {
        validate_serial(serial)?;
        let meter = self
            .lookup
            .lookup(serial)
            .await
            .ok_or_else(|| MediatorError::NotFound(serial.to_string()))?;
        serde_json::to_string_pretty(&json!({ "registry": meter.snapshot() }))
            .map_err(|err| MediatorError::Internal(err.to_string()))
    }

    /// Every known meter as a JSON array.
    pub fn meters(&self) -> Result<String, MediatorError> {
        serde_json::to_string_pretty(&self.lookup.snapshot())
            .map_err(|err| MediatorError::Internal(err.to_string()))
    }

    async fn dispatch(
        &self,
        operation: Operation,
        serial: &str,
        request: Result<MeterRequest, MediatorError>,
    ) -> Result<Vec<u8>, MediatorError> {
        let result = match request {
            Ok(request) => self.mediate(serial, request).await,
            Err(err) => Err(err),
        };
        self.record(operation, serial, &result);
        result
    }

    async fn mediate(&self, serial: &str, request: MeterRequest) -> Result<Vec<u8>, MediatorError> {
        let operation = request.operation();
        let deadline = self.settings.rpc_deadline.map(|limit| Instant::now() + limit);

        let meter = self
            .lookup
            .lookup(serial)
            .await
            .ok_or_else(|| MediatorError::NotFound(serial.to_string()))?;

        let wait_started = Instant::now();
        let acquired = with_deadline(deadline, serial, meter.acquire(self.settings.lock_timeout)).await?;
        let guard = acquired.map_err(|timeout| {
            warn!(serial, waited_ms = timeout.waited.as_millis() as u64, "timeout waiting for meter lock");
            MediatorError::Busy {
                serial: timeout.serial,
                waited: timeout.waited,
            }
        })?;
        if let Some(metrics) = &self.metrics {
            metrics.observe_lock_wait(wait_started.elapsed());
        }

        let conversation = self.spawn_conversation(&meter, guard, request);
        let joined = with_deadline(deadline, serial, conversation).await.map_err(|err| {
            warn!(serial, operation = operation.as_str(), "rpc deadline passed; conversation continues in background");
            err
        })?;
        let (outcome, elapsed) = joined.map_err(|err| {
            MediatorError::Internal(format!("conversation task for meter {serial} failed: {err}"))
        })?;
        if let Some(metrics) = &self.metrics {
            metrics.observe_conversation(operation.as_str(), elapsed);
        }

        outcome.map_err(|source| MediatorError::Meter {
            serial: serial.to_string(),
            source,
        })
    }

    fn spawn_conversation(
        &self,
        meter: &Arc<MeterContext>,
        mut guard: MeterGuard,
        request: MeterRequest,
    ) -> tokio::task::JoinHandle<(Result<Vec<u8>, MeterError>, Duration)> {
        let session = MeterSession::new(
            self.transport.clone(),
            meter.address(),
            self.settings.frame,
        );
        let min_spacing = self.settings.min_spacing;
        tokio::spawn(async move {
            let started = Instant::now();
            guard.space_out(min_spacing).await;
            debug!(serial = guard.serial(), address = %session.address(), "starting meter conversation");
            let outcome = request.run(&session).await;
            // Socket activity happened either way.
            guard.mark_used();
            drop(guard);
            (outcome, started.elapsed())
        })
    }

    fn record(&self, operation: Operation, serial: &str, result: &Result<Vec<u8>, MediatorError>) {
        let outcome = match result {
            Ok(_) => {
                debug!(serial, operation = operation.as_str(), "request complete");
                "ok"
            }
            Err(err) => {
                match err {
                    MediatorError::Meter { source, .. } if source.kind() == FailureKind::ProtocolEof => {
                        warn!(serial, operation = operation.as_str(), error = %err, "meter closed conversation early");
                    }
                    MediatorError::Meter { .. } | MediatorError::Internal(_) => {
                        error!(serial, operation = operation.as_str(), error = %err, "meter request failed");
                    }
                    MediatorError::NotFound(_) | MediatorError::InvalidArgument(_) => {
                        info!(serial, operation = operation.as_str(), error = %err, "request rejected");
                    }
                    MediatorError::Busy { .. } | MediatorError::DeadlineExceeded { .. } => {}
                }
                err.outcome()
            }
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_outcome(operation.as_str(), outcome);
        }
    }
}

async fn with_deadline<F: std::future::Future>(
    deadline: Option<Instant>,
    serial: &str,
    future: F,
) -> Result<F::Output, MediatorError> {
    match deadline {
        Some(at) => timeout_at(at, future)
            .await
            .map_err(|_| MediatorError::DeadlineExceeded {
                serial: serial.to_string(),
            }),
        None => Ok(future.await),
    }
}

fn validate_serial(serial: &str) -> Result<(), MediatorError> {
    if serial.trim().is_empty() {
        return Err(MediatorError::InvalidArgument(
            "target meter serial not specified".into(),
        ));
    }
    Ok(())
}

fn parse_object_id(value: u32) -> Result<ObjectId, MediatorError> {
    ObjectId::new(value).map_err(|err| MediatorError::InvalidArgument(err.to_string()))
}
