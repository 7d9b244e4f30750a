//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "EMOP frame and data field codec."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CodecError, Result};

const MAX_OBJECT_ID: u32 = 0x00FF_FFFF;

/// Three byte register identifier, carried big-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct ObjectId(u32);

impl ObjectId {
    /// Wire size of an object id.
    pub const LEN: usize = 3;

    /// Build an object id, rejecting values wider than 24 bits.
    pub fn new(value: u32) -> Result<Self> {
        if value > MAX_OBJECT_ID {
            return Err(CodecError::ObjectIdOutOfRange(value));
        }
        Ok(Self(value))
    }

    /// Integer value of the id.
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Big-endian wire bytes.
    pub fn to_bytes(self) -> [u8; 3] {
        let [_, a, b, c] = self.0.to_be_bytes();
        [a, b, c]
    }

    /// Decode from big-endian wire bytes.
    pub fn from_bytes(bytes: [u8; 3]) -> Self {
        Self(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]))
    }
}

impl TryFrom<u32> for ObjectId {
    type Error = CodecError;

    fn try_from(value: u32) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ObjectId> for u32 {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.to_bytes()))
    }
}

impl FromStr for ObjectId {
    type Err = CodecError;

    /// Accepts decimal (`8390656`) or `0x` prefixed hex (`0x800800`).
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let parsed = match trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            Some(hex_digits) => u32::from_str_radix(hex_digits, 16),
            None => trimmed.parse::<u32>(),
        };
        let value = parsed
            .map_err(|_| CodecError::MalformedFrame(format!("invalid object id '{trimmed}'")))?;
        Self::new(value)
    }
}
