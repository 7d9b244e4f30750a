//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "TCP transport and session for EMOP meters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::time::Duration;

use emop_codec::CodecError;
use thiserror::Error;

/// Socket level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connect, send or receive did not finish in time.
    #[error("{phase} timed out after {after:?}")]
    Timeout {
        /// Operation that stalled.
        phase: &'static str,
        /// Configured limit.
        after: Duration,
    },
    /// The meter actively refused the TCP connection.
    #[error("connection refused by {target}")]
    Refused {
        /// `host:port` that refused.
        target: String,
    },
    /// Every connect attempt failed.
    #[error("connection failed after {attempts} attempts: {last}")]
    ConnectionFailedAfterRetries {
        /// Attempts made.
        attempts: u32,
        /// Failure of the final attempt.
        last: Box<TransportError>,
    },
    /// The meter closed the link without answering.
    #[error("meter closed the connection before replying")]
    ProtocolEof,
    /// Any other socket error.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of one session operation.
#[derive(Debug, Error)]
pub enum MeterError {
    /// Socket level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The reply could not be decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Closed classification of meter failures used for status mapping,
/// logging levels and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Connect, send or receive timed out.
    Timeout,
    /// The meter refused the connection.
    Refused,
    /// Every connect attempt failed.
    ConnectionFailed,
    /// The meter closed the link before a complete reply.
    ProtocolEof,
    /// Reply CRC did not match.
    ChecksumMismatch,
    /// Reply did not parse as a frame.
    MalformedFrame,
    /// Any other socket error.
    Io,
}

impl FailureKind {
    /// Stable snake_case label.
    pub const fn as_str(self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Refused => "refused",
            FailureKind::ConnectionFailed => "connection_failed",
            FailureKind::ProtocolEof => "protocol_eof",
            FailureKind::ChecksumMismatch => "checksum_mismatch",
            FailureKind::MalformedFrame => "malformed_frame",
            FailureKind::Io => "io",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TransportError {
    /// Classify this failure.
    pub fn kind(&self) -> FailureKind {
        match self {
            TransportError::Timeout { .. } => FailureKind::Timeout,
            TransportError::Refused { .. } => FailureKind::Refused,
            TransportError::ConnectionFailedAfterRetries { .. } => FailureKind::ConnectionFailed,
            TransportError::ProtocolEof => FailureKind::ProtocolEof,
            TransportError::Io(_) => FailureKind::Io,
        }
    }
}

impl MeterError {
    /// Classify this failure. Short replies count as protocol EOF.
    pub fn kind(&self) -> FailureKind {
        match self {
            MeterError::Transport(err) => err.kind(),
            MeterError::Codec(CodecError::Truncated { .. }) => FailureKind::ProtocolEof,
            MeterError::Codec(CodecError::ChecksumMismatch { .. }) => {
                FailureKind::ChecksumMismatch
            }
            MeterError::Codec(_) => FailureKind::MalformedFrame,
        }
    }
}
