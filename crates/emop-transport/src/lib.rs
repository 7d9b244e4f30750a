//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "TCP transport and session for EMOP meters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Point-to-point link to a single meter.
//!
//! [`TcpMeterTransport`] performs one full TCP conversation per call and
//! [`MeterSession`] layers the frame codec on top of any [`MeterTransport`].

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod error;
pub mod session;
pub mod tcp;

pub use error::{FailureKind, MeterError, TransportError};
pub use session::{FrameSettings, MeterSession};
pub use tcp::{ConnectionState, MeterConnection, TcpMeterTransport, TcpSettings};

/// Network location of a meter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeterAddress {
    /// Hostname or IP literal.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl MeterAddress {
    /// Build an address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for MeterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One complete request/response conversation with a meter.
///
/// Implementations open a fresh link per call and close it on every exit
/// path. Callers hold the meter's access lock for the whole call.
#[async_trait]
pub trait MeterTransport: Send + Sync {
    /// Send `request` to `target` and return the raw reply bytes.
    async fn exchange(
        &self,
        target: &MeterAddress,
        request: &[u8],
    ) -> Result<Vec<u8>, TransportError>;
}
