//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "EMOP frame and data field codec."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use thiserror::Error;

/// Convenience result alias for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// Failures raised while encoding or decoding EMOP frames.
///
/// `Truncated` is kept apart from the integrity failures because meters
/// routinely answer with short reads; callers surface it as protocol EOF
/// rather than as corruption.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Structure is wrong: bad delimiter, impossible length, bad flag.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    /// The checksum carried by the frame does not match its content.
    #[error("checksum mismatch: frame carries {received:#06x}, computed {computed:#06x}")]
    ChecksumMismatch {
        /// Value read from the wire.
        received: u16,
        /// Value recomputed over the received bytes.
        computed: u16,
    },
    /// Input ended before the structure being parsed was complete.
    #[error("truncated input: needed {needed} bytes, got {available}")]
    Truncated {
        /// Bytes required by the structure.
        needed: usize,
        /// Bytes actually present.
        available: usize,
    },
    /// Data field format tag is not one this codec understands.
    #[error("unknown data field format {0:#04x}")]
    UnknownFormat(u8),
    /// Object ids are limited to 24 bits.
    #[error("object id {0:#x} does not fit in 3 bytes")]
    ObjectIdOutOfRange(u32),
    /// Encoded frame would not fit the single byte length field.
    #[error("data field of {0} bytes exceeds the frame length limit")]
    FrameTooLarge(usize),
}

impl CodecError {
    /// Whether this failure means the peer stopped sending mid-structure.
    pub fn is_truncation(&self) -> bool {
        matches!(self, CodecError::Truncated { .. })
    }
}
