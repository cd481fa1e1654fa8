//! Safety message validation
//!
//! ECeS messages carry a sequence counter and a CRC-8 in their last byte.
//! ECoS messages are followed by a bit-inverted copy on the next identifier;
//! the tracker keeps the most recent primary frame so the copy can be checked
//! when it arrives.

use std::collections::HashMap;

use crc::{Crc, CRC_8_SAE_J1850};

use canflash_core::CanFrame;

/// Datapool element name of the ECeS sequence counter
pub const COUNTER_SIGNAL: &str = "ECeS_MessageCounter";
/// Datapool element name of the ECeS checksum
pub const CHECKSUM_SIGNAL: &str = "ECeS_Checksum";
/// Counter value after which the sender wraps to zero
pub const COUNTER_ROLLOVER: i64 = 255;

/// Bytes covered by the checksum; the CRC itself is the following byte
const CRC_DATA_LEN: usize = 6;
const CRC_BYTE: usize = 7;

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SAE_J1850);

pub const STATUS_CRC_OK: &str = "CRC OK";
pub const STATUS_CRC_INVALID: &str = "CRC Invalid";
pub const STATUS_INVERTED_OK: &str = "Inverted data OK";
pub const STATUS_INVERTED_INVALID: &str = "Incorrect inverted data";

/// Last ECoS primary frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryFrame {
    pub id: u32,
    pub name: String,
    pub data: [u8; 8],
    pub dlc: u8,
}

/// Safety protocol state carried across frames
#[derive(Debug, Default)]
pub struct SafetyMessageTracker {
    counters: HashMap<u32, i64>,
    primary: Option<PrimaryFrame>,
}

impl SafetyMessageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.counters.clear();
        self.primary = None;
    }

    /// Compare a counter value with the last one seen on `id`
    ///
    /// Returns the failure text when the step is not +1. A jump of exactly the
    /// rollover maximum in either direction counts as +1. The new value is
    /// stored in every case.
    pub fn check_counter(&mut self, id: u32, value: i64) -> Option<String> {
        let previous = self.counters.insert(id, value)?;
        let mut diff = value - previous;
        if diff.abs() == COUNTER_ROLLOVER {
            diff = 1;
        }
        if diff == 1 {
            None
        } else {
            Some(format!(
                "Counter Invalid (diff {:+}, previous {})",
                diff, previous
            ))
        }
    }

    /// Full ECeS status text for one frame
    pub fn validate_eces(&mut self, id: u32, counter: i64, data: &[u8]) -> String {
        let mut parts = Vec::with_capacity(2);
        if let Some(counter_status) = self.check_counter(id, counter) {
            parts.push(counter_status);
        }
        parts.push(check_crc(data).to_string());
        parts.join(", ")
    }

    pub fn last_counter(&self, id: u32) -> Option<i64> {
        self.counters.get(&id).copied()
    }

    pub fn remember_primary(&mut self, frame: &CanFrame, name: &str) {
        self.primary = Some(PrimaryFrame {
            id: frame.id,
            name: name.to_string(),
            data: frame.data,
            dlc: frame.dlc,
        });
    }

    pub fn primary(&self) -> Option<&PrimaryFrame> {
        self.primary.as_ref()
    }

    /// Check a frame against the remembered primary frame
    ///
    /// Applies when `id - 1` equals the primary identifier and the DLC
    /// matches; the extended flag is not compared.
    pub fn check_inverted(&self, frame: &CanFrame) -> Option<&'static str> {
        let primary = self.primary.as_ref()?;
        if frame.id.checked_sub(1) != Some(primary.id) || frame.dlc != primary.dlc {
            return None;
        }
        let len = frame.dlc.min(8) as usize;
        let inverted = frame.data[..len]
            .iter()
            .zip(&primary.data[..len])
            .all(|(copy, original)| *copy == !*original);
        Some(if inverted {
            STATUS_INVERTED_OK
        } else {
            STATUS_INVERTED_INVALID
        })
    }
}

pub fn crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

/// CRC over bytes 0..6 compared with byte 7
pub fn check_crc(data: &[u8]) -> &'static str {
    if data.len() <= CRC_BYTE {
        return STATUS_CRC_INVALID;
    }
    if crc8(&data[..CRC_DATA_LEN]) == data[CRC_BYTE] {
        STATUS_CRC_OK
    } else {
        STATUS_CRC_INVALID
    }
}
