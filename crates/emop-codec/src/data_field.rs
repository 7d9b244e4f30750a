//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "EMOP frame and data field codec."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Data field variants carried inside an EMOP frame.
//!
//! | Tag  | Variant               | Layout after the tag                              |
//! |------|-----------------------|---------------------------------------------------|
//! | 0x01 | default               | object id (3 BE), access flag (1), payload        |
//! | 0x02 | event log             | object id (3 BE), log index (1), payload          |
//! | 0x03 | profile log 1         | timestamp (4 LE), records                         |
//! | 0x04 | profile log 2         | timestamp (4 LE), records                         |
//! | 0x05 | three phase intervals | request: profile (1), start (4 LE), end (4 LE), `FF FF FF FF`; response: opaque block |

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{CodecError, Result};
use crate::object_id::ObjectId;

/// Fixed trailer closing a three phase interval request.
pub const THREE_PHASE_TRAILER: [u8; 4] = [0xFF; 4];

const TAG_LEN: usize = 1;
const DEFAULT_FIXED_LEN: usize = TAG_LEN + ObjectId::LEN + 1;
const PROFILE_FIXED_LEN: usize = TAG_LEN + 4;
const THREE_PHASE_REQUEST_LEN: usize = TAG_LEN + 1 + 4 + 4 + THREE_PHASE_TRAILER.len();

/// Format tag at the start of every data field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordFormat {
    /// Register read or write.
    Default = 0x01,
    /// Indexed event log entry.
    EventLog = 0x02,
    /// Load profile log, channel set one.
    ProfileLog1 = 0x03,
    /// Load profile log, channel set two.
    ProfileLog2 = 0x04,
    /// Three phase interval block.
    ThreePhaseIntervals = 0x05,
}

impl RecordFormat {
    /// Wire value of the tag.
    pub const fn tag(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for RecordFormat {
    type Error = CodecError;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            0x01 => Ok(Self::Default),
            0x02 => Ok(Self::EventLog),
            0x03 => Ok(Self::ProfileLog1),
            0x04 => Ok(Self::ProfileLog2),
            0x05 => Ok(Self::ThreePhaseIntervals),
            other => Err(CodecError::UnknownFormat(other)),
        }
    }
}

/// Which side of a conversation produced a data field.
///
/// Some layouts are only distinguishable by who sent them: a three phase
/// response block can have the exact shape of a range request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Sent to a meter.
    Request,
    /// Returned by a meter.
    Response,
}

/// Direction flag of a default data field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Access {
    /// Read the register.
    Read = 0,
    /// Write the register.
    Write = 1,
}

impl TryFrom<u8> for Access {
    type Error = CodecError;

    fn try_from(flag: u8) -> Result<Self> {
        match flag {
            0 => Ok(Self::Read),
            1 => Ok(Self::Write),
            other => Err(CodecError::MalformedFrame(format!(
                "read/write flag must be 0 or 1, got {other}"
            ))),
        }
    }
}

/// Register read/write body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRecord {
    /// Register addressed.
    pub object_id: ObjectId,
    /// Read or write.
    pub access: Access,
    /// Register bytes; empty for read requests.
    pub payload: Vec<u8>,
}

/// Event log body. Requests carry no payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLogRecord {
    /// Log object addressed.
    pub object_id: ObjectId,
    /// Entry index within the log.
    pub log_index: u8,
    /// Entry bytes; empty in requests.
    pub payload: Vec<u8>,
}

/// Profile log body. A request carries only the timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileLogRecord {
    /// Epoch seconds of the first interval.
    pub timestamp: u32,
    /// Concatenated fixed-size interval records; empty in requests.
    pub records: Vec<u8>,
}

impl ProfileLogRecord {
    /// Whether this body is a request (timestamp only).
    pub fn is_request(&self) -> bool {
        self.records.is_empty()
    }
}

/// Three phase interval body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreePhaseIntervals {
    /// Range request for one profile.
    Request {
        /// Profile number.
        profile: u8,
        /// Range start, epoch seconds.
        start: u32,
        /// Range end, epoch seconds.
        end: u32,
    },
    /// Opaque per-channel record block returned by the meter.
    Response(Vec<u8>),
}

/// Decoded data field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataField {
    /// Tag 0x01.
    Default(DefaultRecord),
    /// Tag 0x02.
    EventLog(EventLogRecord),
    /// Tag 0x03.
    ProfileLog1(ProfileLogRecord),
    /// Tag 0x04.
    ProfileLog2(ProfileLogRecord),
    /// Tag 0x05.
    ThreePhaseIntervals(ThreePhaseIntervals),
}

impl DataField {
    /// Read request for a register.
    pub fn read(object_id: ObjectId) -> Self {
        DataField::Default(DefaultRecord {
            object_id,
            access: Access::Read,
            payload: Vec::new(),
        })
    }

    /// Write request carrying `payload`.
    pub fn write(object_id: ObjectId, payload: impl Into<Vec<u8>>) -> Self {
        DataField::Default(DefaultRecord {
            object_id,
            access: Access::Write,
            payload: payload.into(),
        })
    }

    /// Format tag of this variant.
    pub fn format(&self) -> RecordFormat {
        match self {
            DataField::Default(_) => RecordFormat::Default,
            DataField::EventLog(_) => RecordFormat::EventLog,
            DataField::ProfileLog1(_) => RecordFormat::ProfileLog1,
            DataField::ProfileLog2(_) => RecordFormat::ProfileLog2,
            DataField::ThreePhaseIntervals(_) => RecordFormat::ThreePhaseIntervals,
        }
    }

    /// Bytes handed back to RPC callers for a response.
    pub fn response_payload(&self) -> &[u8] {
        match self {
            DataField::Default(record) => &record.payload,
            DataField::EventLog(record) => &record.payload,
            DataField::ProfileLog1(record) | DataField::ProfileLog2(record) => &record.records,
            DataField::ThreePhaseIntervals(ThreePhaseIntervals::Response(block)) => block,
            DataField::ThreePhaseIntervals(ThreePhaseIntervals::Request { .. }) => &[],
        }
    }

    /// Encoded size including the tag.
    pub fn encoded_len(&self) -> usize {
        match self {
            DataField::Default(record) => DEFAULT_FIXED_LEN + record.payload.len(),
            DataField::EventLog(record) => DEFAULT_FIXED_LEN + record.payload.len(),
            DataField::ProfileLog1(record) | DataField::ProfileLog2(record) => {
                PROFILE_FIXED_LEN + record.records.len()
            }
            DataField::ThreePhaseIntervals(ThreePhaseIntervals::Request { .. }) => {
                THREE_PHASE_REQUEST_LEN
            }
            DataField::ThreePhaseIntervals(ThreePhaseIntervals::Response(block)) => {
                TAG_LEN + block.len()
            }
        }
    }

    /// Append the wire form to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u8(self.format().tag());
        match self {
            DataField::Default(record) => {
                buf.put_slice(&record.object_id.to_bytes());
                buf.put_u8(record.access as u8);
                buf.put_slice(&record.payload);
            }
            DataField::EventLog(record) => {
                buf.put_slice(&record.object_id.to_bytes());
                buf.put_u8(record.log_index);
                buf.put_slice(&record.payload);
            }
            DataField::ProfileLog1(record) | DataField::ProfileLog2(record) => {
                buf.put_u32_le(record.timestamp);
                buf.put_slice(&record.records);
            }
            DataField::ThreePhaseIntervals(ThreePhaseIntervals::Request {
                profile,
                start,
                end,
            }) => {
                buf.put_u8(*profile);
                buf.put_u32_le(*start);
                buf.put_u32_le(*end);
                buf.put_slice(&THREE_PHASE_TRAILER);
            }
            DataField::ThreePhaseIntervals(ThreePhaseIntervals::Response(block)) => {
                buf.put_slice(block);
            }
        }
    }

    /// Wire form as an owned buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.to_vec()
    }

    /// Parse a complete data field as sent to a meter.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Self::decode_as(bytes, Direction::Request)
    }

    /// Parse a complete data field returned by a meter. Tag 0x05 always
    /// yields a response block here.
    pub fn decode_response(bytes: &[u8]) -> Result<Self> {
        Self::decode_as(bytes, Direction::Response)
    }

    /// Parse a complete data field produced by `direction`.
    pub fn decode_as(bytes: &[u8], direction: Direction) -> Result<Self> {
        let Some(&tag) = bytes.first() else {
            return Err(CodecError::Truncated {
                needed: TAG_LEN,
                available: 0,
            });
        };
        let format = RecordFormat::try_from(tag)?;
        let mut body = &bytes[TAG_LEN..];

        match format {
            RecordFormat::Default => {
                require(bytes, DEFAULT_FIXED_LEN)?;
                let object_id = read_object_id(&mut body);
                let access = Access::try_from(body.get_u8())?;
                Ok(DataField::Default(DefaultRecord {
                    object_id,
                    access,
                    payload: body.to_vec(),
                }))
            }
            RecordFormat::EventLog => {
                require(bytes, DEFAULT_FIXED_LEN)?;
                let object_id = read_object_id(&mut body);
                let log_index = body.get_u8();
                Ok(DataField::EventLog(EventLogRecord {
                    object_id,
                    log_index,
                    payload: body.to_vec(),
                }))
            }
            RecordFormat::ProfileLog1 | RecordFormat::ProfileLog2 => {
                require(bytes, PROFILE_FIXED_LEN)?;
                let record = ProfileLogRecord {
                    timestamp: body.get_u32_le(),
                    records: body.to_vec(),
                };
                Ok(if format == RecordFormat::ProfileLog1 {
                    DataField::ProfileLog1(record)
                } else {
                    DataField::ProfileLog2(record)
                })
            }
            RecordFormat::ThreePhaseIntervals => {
                if direction == Direction::Request
                    && bytes.len() == THREE_PHASE_REQUEST_LEN
                    && bytes.ends_with(&THREE_PHASE_TRAILER)
                {
                    let profile = body.get_u8();
                    let start = body.get_u32_le();
                    let end = body.get_u32_le();
                    Ok(DataField::ThreePhaseIntervals(ThreePhaseIntervals::Request {
                        profile,
                        start,
                        end,
                    }))
                } else {
                    Ok(DataField::ThreePhaseIntervals(ThreePhaseIntervals::Response(
                        body.to_vec(),
                    )))
                }
            }
        }
    }
}

fn require(bytes: &[u8], needed: usize) -> Result<()> {
    if bytes.len() < needed {
        return Err(CodecError::Truncated {
            needed,
            available: bytes.len(),
        });
    }
    Ok(())
}

fn read_object_id(body: &mut &[u8]) -> ObjectId {
    let mut raw = [0u8; ObjectId::LEN];
    body.copy_to_slice(&mut raw);
    ObjectId::from_bytes(raw)
}
