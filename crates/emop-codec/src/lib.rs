//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "EMOP frame and data field codec."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Binary codec for the EMOP meter protocol.
//!
//! A [`Frame`] wraps an opaque [`DataField`] in a fixed envelope
//! (delimiter, length, control, destination, source, CRC). The data field
//! carries a format tag selecting one of the request/response layouts in
//! [`data_field`]. Nothing here interprets register semantics.
#![warn(missing_docs)]

pub mod crc;
pub mod data_field;
pub mod error;
pub mod frame;
pub mod object_id;

pub use crc::{crc16_ccitt_false, Crc16};
pub use data_field::{
    Access, DataField, DefaultRecord, Direction, EventLogRecord, ProfileLogRecord, RecordFormat,
    ThreePhaseIntervals, THREE_PHASE_TRAILER,
};
pub use error::{CodecError, Result};
pub use frame::{DeviceAddress, Frame, FRAME_DELIMITER, FRAME_OVERHEAD, MAX_DATA_FIELD_LEN};
pub use object_id::ObjectId;
