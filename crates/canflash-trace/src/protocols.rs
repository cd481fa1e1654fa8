//! Raw protocol text for frames without a network description match
//!
//! Each decoder turns identifier and payload into a one-line description.
//! Numbers are rendered either as `0x`-prefixed hex or as decimal, so the
//! interpreter produces both variants for every frame.

use serde::{Deserialize, Serialize};

use canflash_core::CanFrame;

/// Higher layer protocol assumed for unresolved frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawProtocol {
    /// No interpretation beyond layer 2
    #[default]
    Layer2,
    CanOpen,
    J1939,
}

impl RawProtocol {
    /// Describe a frame; `None` when the protocol has nothing to say about it
    pub fn decode(self, frame: &CanFrame, hex: bool) -> Option<String> {
        match self {
            RawProtocol::Layer2 => None,
            RawProtocol::CanOpen => decode_canopen(frame, hex),
            RawProtocol::J1939 => decode_j1939(frame, hex),
        }
    }
}

fn num(value: u32, hex: bool, width: usize) -> String {
    if hex {
        format!("0x{:0width$X}", value, width = width)
    } else {
        value.to_string()
    }
}

// =============================================================================
// CANopen
// =============================================================================

fn decode_canopen(frame: &CanFrame, hex: bool) -> Option<String> {
    if frame.extended || frame.id > 0x7FF {
        return None;
    }
    let data = frame.payload();
    let id = frame.id;
    let node = id & 0x7F;
    let node_text = num(node, hex, 2);

    let text = match id {
        0x000 => {
            let command = match data.first()? {
                0x01 => "Start",
                0x02 => "Stop",
                0x80 => "Enter Pre-Operational",
                0x81 => "Reset Node",
                0x82 => "Reset Communication",
                _ => "Unknown Command",
            };
            match data.get(1).copied().unwrap_or(0) {
                0 => format!("NMT {} all nodes", command),
                target => format!("NMT {} Node {}", command, num(target as u32, hex, 2)),
            }
        }
        0x080 => "SYNC".to_string(),
        0x081..=0x0FF => {
            let code = u16::from_le_bytes([*data.first()?, *data.get(1)?]);
            format!(
                "EMCY Node {} Error code {}",
                node_text,
                num(code as u32, hex, 4)
            )
        }
        0x100 => "TIME".to_string(),
        0x181..=0x57F => {
            let base = id & !0x7F;
            let (kind, number) = match base {
                0x180 => ("TPDO", 1),
                0x200 => ("RPDO", 1),
                0x280 => ("TPDO", 2),
                0x300 => ("RPDO", 2),
                0x380 => ("TPDO", 3),
                0x400 => ("RPDO", 3),
                0x480 => ("TPDO", 4),
                0x500 => ("RPDO", 4),
                _ => return None,
            };
            format!("{}{} Node {}", kind, number, node_text)
        }
        0x581..=0x5FF | 0x601..=0x67F => {
            let direction = if id < 0x600 { "Response" } else { "Request" };
            let mut text = format!("SDO {} Node {}", direction, node_text);
            if data.len() >= 4 {
                let index = u16::from_le_bytes([data[1], data[2]]);
                text.push_str(&format!(
                    " Index {} Sub {}",
                    num(index as u32, hex, 4),
                    num(data[3] as u32, hex, 2)
                ));
            }
            text
        }
        0x701..=0x77F => {
            let state = match data.first().map(|b| b & 0x7F) {
                Some(0x00) => "Boot-up",
                Some(0x04) => "Stopped",
                Some(0x05) => "Operational",
                Some(0x7F) => "Pre-Operational",
                _ => "Unknown State",
            };
            format!("Heartbeat Node {} {}", node_text, state)
        }
        0x7E4 => "LSS Response".to_string(),
        0x7E5 => "LSS Request".to_string(),
        _ => return None,
    };
    Some(text)
}

// =============================================================================
// J1939
// =============================================================================

fn pgn_name(pgn: u32) -> Option<&'static str> {
    match pgn {
        0xEA00 => Some("Request"),
        0xEE00 => Some("Address Claimed"),
        0xEC00 => Some("TP.CM"),
        0xEB00 => Some("TP.DT"),
        0xE800 => Some("Acknowledgment"),
        0xFECA => Some("DM1"),
        _ => None,
    }
}

fn decode_j1939(frame: &CanFrame, hex: bool) -> Option<String> {
    if !frame.extended {
        return None;
    }
    let id = frame.id & 0x1FFF_FFFF;
    let priority = (id >> 26) & 0x7;
    let pdu_format = (id >> 16) & 0xFF;
    let pdu_specific = (id >> 8) & 0xFF;
    let source = id & 0xFF;

    // PDU1 carries a destination address in the PS field
    let (pgn, destination) = if pdu_format < 240 {
        ((id >> 8) & 0x3FF00, Some(pdu_specific))
    } else {
        ((id >> 8) & 0x3FFFF, None)
    };

    let mut text = format!("J1939 PGN {}", num(pgn, hex, 4));
    if let Some(name) = pgn_name(pgn) {
        text.push_str(&format!(" ({})", name));
    }
    text.push_str(&format!(" Prio {} SA {}", priority, num(source, hex, 2)));
    if let Some(da) = destination {
        text.push_str(&format!(" DA {}", num(da, hex, 2)));
    }
    Some(text)
}
