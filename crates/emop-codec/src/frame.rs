//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "EMOP frame and data field codec."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Frame envelope.
//!
//! ```text
//! [0]      0x7E delimiter
//! [1]      frame length (total bytes excluding the delimiter)
//! [2]      control
//! [3]      destination device type
//! [4..=6]  destination address (BE)
//! [7]      source device type
//! [8..=10] source address (BE)
//! [11..]   data field
//! [-2..]   CRC-16/CCITT-FALSE over [1..-2], BE
//! ```

use std::fmt;

use bytes::{BufMut, BytesMut};

use crate::crc::{crc16_ccitt_false, Crc16};
use crate::data_field::{DataField, Direction};
use crate::error::{CodecError, Result};

/// Leading byte of every frame.
pub const FRAME_DELIMITER: u8 = 0x7E;
/// Bytes counted by the length field besides the data field:
/// length, control, destination, source and CRC.
pub const FRAME_OVERHEAD: usize = 12;
/// Largest data field the single byte length field can describe.
pub const MAX_DATA_FIELD_LEN: usize = u8::MAX as usize - FRAME_OVERHEAD;

const HEADER_LEN: usize = 11;
const CRC_LEN: usize = 2;
const MIN_FRAME_LEN: usize = 1 + FRAME_OVERHEAD;
const MAX_ADDRESS: u32 = 0x00FF_FFFF;

/// Device type plus 24-bit address identifying one end of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceAddress {
    /// Device class byte.
    pub device_type: u8,
    /// 24-bit address.
    pub address: u32,
}

impl DeviceAddress {
    /// Build an address.
    pub const fn new(device_type: u8, address: u32) -> Self {
        Self {
            device_type,
            address,
        }
    }

    fn put(&self, buf: &mut BytesMut) -> Result<()> {
        if self.address > MAX_ADDRESS {
            return Err(CodecError::MalformedFrame(format!(
                "device address {:#x} does not fit in 3 bytes",
                self.address
            )));
        }
        let [_, a, b, c] = self.address.to_be_bytes();
        buf.put_slice(&[self.device_type, a, b, c]);
        Ok(())
    }

    fn parse(raw: &[u8]) -> Self {
        Self {
            device_type: raw[0],
            address: u32::from_be_bytes([0, raw[1], raw[2], raw[3]]),
        }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}:{:06X}", self.device_type, self.address)
    }
}

/// One EMOP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Control byte.
    pub control: u8,
    /// Receiving device.
    pub destination: DeviceAddress,
    /// Sending device.
    pub source: DeviceAddress,
    /// Typed body.
    pub data: DataField,
}

impl Frame {
    /// Encode to wire bytes.
    ///
    /// The envelope is written with a zero checksum first, then the CRC is
    /// computed over the written bytes and patched in place.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let data_len = self.data.encoded_len();
        if data_len > MAX_DATA_FIELD_LEN {
            return Err(CodecError::FrameTooLarge(data_len));
        }

        let mut buf = BytesMut::with_capacity(1 + FRAME_OVERHEAD + data_len);
        buf.put_u8(FRAME_DELIMITER);
        buf.put_u8((FRAME_OVERHEAD + data_len) as u8);
        buf.put_u8(self.control);
        self.destination.put(&mut buf)?;
        self.source.put(&mut buf)?;
        self.data.encode_into(&mut buf);
        buf.put_u16(0);

        let crc_at = buf.len() - CRC_LEN;
        let crc = crc16_ccitt_false(&buf[1..crc_at]);
        buf[crc_at..].copy_from_slice(&crc.to_be_bytes());
        Ok(buf.to_vec())
    }

    /// Decode one request frame from the start of `buf`. Bytes past the
    /// declared length are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        Self::decode_as(buf, Direction::Request)
    }

    /// Decode one frame received from a meter.
    pub fn decode_response(buf: &[u8]) -> Result<Self> {
        Self::decode_as(buf, Direction::Response)
    }

    /// Decode one frame whose data field was produced by `direction`.
    pub fn decode_as(buf: &[u8], direction: Direction) -> Result<Self> {
        match buf.first() {
            None => {
                return Err(CodecError::Truncated {
                    needed: MIN_FRAME_LEN,
                    available: 0,
                })
            }
            Some(&FRAME_DELIMITER) => {}
            Some(other) => {
                return Err(CodecError::MalformedFrame(format!(
                    "expected delimiter {FRAME_DELIMITER:#04x}, got {other:#04x}"
                )))
            }
        }
        if buf.len() < 2 {
            return Err(CodecError::Truncated {
                needed: MIN_FRAME_LEN,
                available: buf.len(),
            });
        }

        let frame_length = buf[1] as usize;
        let total = 1 + frame_length;
        if frame_length < FRAME_OVERHEAD {
            return Err(corrupted_length(buf).unwrap_or_else(|| {
                CodecError::MalformedFrame(format!(
                    "frame length {frame_length} is below the {FRAME_OVERHEAD} byte envelope"
                ))
            }));
        }
        if buf.len() < total {
            return Err(corrupted_length(buf).unwrap_or(CodecError::Truncated {
                needed: total,
                available: buf.len(),
            }));
        }

        let crc_at = total - CRC_LEN;
        let received = u16::from_be_bytes([buf[crc_at], buf[crc_at + 1]]);
        let computed = crc16_ccitt_false(&buf[1..crc_at]);
        if received != computed {
            return Err(CodecError::ChecksumMismatch { received, computed });
        }

        Ok(Frame {
            control: buf[2],
            destination: DeviceAddress::parse(&buf[3..7]),
            source: DeviceAddress::parse(&buf[7..HEADER_LEN]),
            data: DataField::decode_as(&buf[HEADER_LEN..crc_at], direction)?,
        })
    }
}

/// Detects a frame whose only defect is its length byte: the buffer checks
/// out once the length is taken from the buffer size instead.
fn corrupted_length(buf: &[u8]) -> Option<CodecError> {
    let len = buf.len();
    if len < MIN_FRAME_LEN || len - 1 > u8::MAX as usize {
        return None;
    }
    let crc_at = len - CRC_LEN;
    let received = u16::from_be_bytes([buf[crc_at], buf[crc_at + 1]]);
    let repaired = Crc16::new()
        .update(&[(len - 1) as u8])
        .update(&buf[2..crc_at])
        .finish();
    (repaired == received).then(|| CodecError::ChecksumMismatch {
        received,
        computed: crc16_ccitt_false(&buf[1..crc_at]),
    })
}
