//! Raw CAN frame as delivered by a transport

use serde::{Deserialize, Serialize};

/// Number of distinct 11-bit identifiers
pub const STANDARD_ID_COUNT: usize = 2048;

/// Maximum classic CAN payload length
pub const MAX_DLC: u8 = 8;

/// A classic CAN frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CanFrame {
    /// Identifier (11 or 29 bit)
    pub id: u32,
    /// 29-bit identifier flag
    pub extended: bool,
    /// Remote transmission request
    pub rtr: bool,
    /// Declared payload length
    pub dlc: u8,
    /// Payload; bytes beyond `dlc` are zero
    pub data: [u8; 8],
    /// Receive/transmit time in microseconds
    pub timestamp_us: u64,
    /// Frame was sent by this tool
    #[serde(default)]
    pub tx: bool,
}

impl CanFrame {
    /// Build a received data frame; payloads longer than 8 bytes are truncated
    pub fn new(id: u32, extended: bool, payload: &[u8]) -> Self {
        let len = payload.len().min(MAX_DLC as usize);
        let mut data = [0u8; 8];
        data[..len].copy_from_slice(&payload[..len]);
        Self {
            id,
            extended,
            rtr: false,
            dlc: len as u8,
            data,
            timestamp_us: 0,
            tx: false,
        }
    }

    pub fn with_timestamp(mut self, timestamp_us: u64) -> Self {
        self.timestamp_us = timestamp_us;
        self
    }

    /// Override the declared length without touching the payload
    pub fn with_dlc(mut self, dlc: u8) -> Self {
        self.dlc = dlc;
        self
    }

    /// The valid part of the payload
    pub fn payload(&self) -> &[u8] {
        &self.data[..(self.dlc.min(MAX_DLC)) as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_truncates_long_payload() {
        let frame = CanFrame::new(0x123, false, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(frame.dlc, 8);
        assert_eq!(frame.payload(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_payload_respects_dlc() {
        let frame = CanFrame::new(0x10, false, &[0xAA, 0xBB, 0xCC]);
        assert_eq!(frame.payload(), &[0xAA, 0xBB, 0xCC]);
        assert_eq!(frame.data[3], 0);

        let short = frame.with_dlc(1);
        assert_eq!(short.payload(), &[0xAA]);
    }
}
