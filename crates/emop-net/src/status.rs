//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Mapping between mediator errors and gRPC status codes."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use emop_transport::FailureKind;
use tonic::Status;

use crate::service::MediatorError;

/// Detail prefix for a meter that hung up mid-conversation.
pub const PROTOCOL_EOF_DETAIL: &str = "protocol EOF";
/// Detail prefix for exhausted connect attempts.
pub const CONNECTION_FAILED_DETAIL: &str = "connection failed after retries";
/// Detail prefix for every other meter failure.
pub const METER_FAILURE_DETAIL: &str = "meter communication failed";

impl From<MediatorError> for Status {
    fn from(err: MediatorError) -> Self {
        match err {
            MediatorError::InvalidArgument(message) => Status::invalid_argument(message),
            MediatorError::NotFound(serial) => {
                Status::not_found(format!("meter '{serial}' not known"))
            }
            MediatorError::Busy { serial, .. } => {
                Status::resource_exhausted(format!("meter {serial} is busy (timeout)"))
            }
            MediatorError::DeadlineExceeded { serial } => {
                Status::deadline_exceeded(format!("deadline exceeded for meter {serial}"))
            }
            MediatorError::Meter { serial, source } => {
                let prefix = match source.kind() {
                    FailureKind::ProtocolEof => PROTOCOL_EOF_DETAIL,
                    FailureKind::ConnectionFailed => CONNECTION_FAILED_DETAIL,
                    _ => METER_FAILURE_DETAIL,
                };
                Status::internal(format!("{prefix}: meter={serial}: {source}"))
            }
            MediatorError::Internal(message) => {
                Status::internal(format!("{METER_FAILURE_DETAIL}: {message}"))
            }
        }
    }
}
