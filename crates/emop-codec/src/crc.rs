//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "EMOP frame and data field codec."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! CRC-16/CCITT-FALSE: poly 0x1021, init 0xFFFF, no reflection, no final XOR.
//! The catalogue name of this algorithm is CRC-16/IBM-3740.

use crc::{Crc, Digest, CRC_16_IBM_3740};

static EMOP_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Streaming CRC-16/CCITT-FALSE digest.
#[derive(Clone)]
pub struct Crc16 {
    digest: Digest<'static, u16>,
}

impl Default for Crc16 {
    fn default() -> Self {
        Self::new()
    }
}

impl Crc16 {
    /// Start a new digest.
    pub fn new() -> Self {
        Self {
            digest: EMOP_CRC.digest(),
        }
    }

    /// Feed bytes into the digest.
    pub fn update(mut self, data: &[u8]) -> Self {
        self.digest.update(data);
        self
    }

    /// Final checksum value.
    pub fn finish(self) -> u16 {
        self.digest.finalize()
    }
}

/// One-shot CRC-16/CCITT-FALSE over `data`.
pub fn crc16_ccitt_false(data: &[u8]) -> u16 {
    EMOP_CRC.checksum(data)
}
