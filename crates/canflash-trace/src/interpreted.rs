//! Interpreted frame and signal records handed to trace sinks

use canflash_core::CanFrame;

use crate::codec::{BitLayout, DecodedSignal};

/// Microseconds per day; time-of-day stamps wrap here
pub const DAY_US: u64 = 24 * 60 * 60 * 1_000_000;

#[derive(Debug, Clone, PartialEq)]
pub struct InterpretedSignal {
    pub name: String,
    pub value: String,
    pub unit: String,
    pub raw_dec: String,
    pub raw_hex: String,
    pub comment: String,
    pub dlc_error: bool,
    pub layout: BitLayout,
}

impl InterpretedSignal {
    pub fn from_decoded(
        name: impl Into<String>,
        unit: impl Into<String>,
        comment: impl Into<String>,
        decoded: DecodedSignal,
    ) -> Self {
        Self {
            name: name.into(),
            value: decoded.value,
            unit: unit.into(),
            raw_dec: decoded.raw_dec,
            raw_hex: decoded.raw_hex,
            comment: comment.into(),
            dlc_error: decoded.dlc_error,
            layout: decoded.layout,
        }
    }
}

/// One frame after the interpretation pipeline
///
/// Frames that match no network description keep their decode fields empty.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InterpretedFrame {
    pub frame: CanFrame,
    /// Time since the previous frame
    pub relative_us: u64,
    /// Time since the first frame after start
    pub absolute_us: u64,
    /// Wall-clock time of day, wraps at 24h
    pub time_of_day_us: u64,

    pub id_hex: String,
    pub id_dec: String,
    pub dlc_text: String,
    pub data_hex: String,
    pub data_dec: String,

    pub message_name: String,
    /// Frame DLC differs from the message definition
    pub dlc_error: bool,
    /// Sorted ascending by start bit
    pub signals: Vec<InterpretedSignal>,
    pub status: String,
    /// Occurrences of this identifier since start
    pub counter: u32,

    pub protocol_text_hex: String,
    pub protocol_text_dec: String,
}

impl InterpretedFrame {
    /// Fill the raw text fields from the frame
    pub fn new(frame: CanFrame) -> Self {
        let data = frame.payload();
        Self {
            frame,
            id_hex: format!("{:X}", frame.id),
            id_dec: frame.id.to_string(),
            dlc_text: frame.dlc.to_string(),
            data_hex: format_data_hex(data),
            data_dec: format_data_dec(data),
            ..Self::default()
        }
    }

    pub fn is_resolved(&self) -> bool {
        !self.message_name.is_empty()
    }

    pub fn sort_signals(&mut self) {
        self.signals.sort_by_key(|s| s.layout.start_bit);
    }

    pub fn protocol_text(&self, hex: bool) -> &str {
        if hex {
            &self.protocol_text_hex
        } else {
            &self.protocol_text_dec
        }
    }
}

pub fn format_data_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn format_data_dec(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:03}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// `seconds.micros` text of a microsecond stamp
pub fn format_seconds(us: u64) -> String {
    format!("{}.{:06}", us / 1_000_000, us % 1_000_000)
}

/// `HH:MM:SS.mmm` text of a time-of-day stamp
pub fn format_time_of_day(us: u64) -> String {
    let us = us % DAY_US;
    let ms = us / 1_000;
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        ms / 3_600_000,
        (ms / 60_000) % 60,
        (ms / 1_000) % 60,
        ms % 1_000
    )
}
