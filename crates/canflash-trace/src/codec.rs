//! Signal extraction from CAN payloads
//!
//! A [`BitLayout`] is compiled once into a list of byte-wise [`Step`]s; every
//! decode then only shifts and masks. Intel signals are numbered from the
//! LSB of byte 0 upwards. Motorola signals follow the DBC convention where the
//! start bit is the MSB of the signal and bits are consumed MSB first.

use std::collections::BTreeMap;

use canflash_core::{DatapoolElement, MuxRole, SignalByteOrder, ValueType};

/// Text used for every decode field that could not be extracted
pub const NOT_AVAILABLE: &str = "N/A";

/// Position of a signal inside a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitLayout {
    pub start_bit: u16,
    pub bit_length: u16,
    pub byte_order: SignalByteOrder,
    pub mux: MuxRole,
}

impl BitLayout {
    pub fn intel(start_bit: u16, bit_length: u16) -> Self {
        Self {
            start_bit,
            bit_length,
            byte_order: SignalByteOrder::Intel,
            mux: MuxRole::Plain,
        }
    }

    pub fn motorola(start_bit: u16, bit_length: u16) -> Self {
        Self {
            start_bit,
            bit_length,
            byte_order: SignalByteOrder::Motorola,
            mux: MuxRole::Plain,
        }
    }

    pub fn with_mux(mut self, mux: MuxRole) -> Self {
        self.mux = mux;
        self
    }
}

/// Conversion from raw to physical value
#[derive(Debug, Clone, PartialEq)]
pub struct Scaling {
    pub factor: f64,
    pub offset: f64,
    pub value_type: ValueType,
    pub value_table: BTreeMap<i64, String>,
}

impl Default for Scaling {
    fn default() -> Self {
        Self {
            factor: 1.0,
            offset: 0.0,
            value_type: ValueType::U64,
            value_table: BTreeMap::new(),
        }
    }
}

impl From<&DatapoolElement> for Scaling {
    fn from(element: &DatapoolElement) -> Self {
        Self {
            factor: element.factor,
            offset: element.offset,
            value_type: element.value_type,
            value_table: element.value_table.clone(),
        }
    }
}

impl Scaling {
    fn is_identity(&self) -> bool {
        self.factor == 1.0 && self.offset == 0.0
    }
}

/// Result of one signal decode
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSignal {
    /// Physical value text
    pub value: String,
    pub raw_dec: String,
    pub raw_hex: String,
    /// Raw integer; `None` for floats and unavailable signals
    pub raw: Option<i64>,
    /// Bit range lies beyond the frame DLC
    pub dlc_error: bool,
    pub layout: BitLayout,
}

impl DecodedSignal {
    fn not_available(layout: BitLayout, dlc_error: bool) -> Self {
        Self {
            value: NOT_AVAILABLE.to_string(),
            raw_dec: NOT_AVAILABLE.to_string(),
            raw_hex: NOT_AVAILABLE.to_string(),
            raw: None,
            dlc_error,
            layout,
        }
    }
}

/// Elementary extraction step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Step {
    /// Source byte index
    pub(crate) byte_index: u8,
    /// LSB within the source byte (0..7)
    pub(crate) src_lsb: u8,
    /// Number of bits taken (1..8)
    pub(crate) width: u8,
    /// Destination LSB in the raw value
    pub(crate) dst_lsb: u16,
}

impl Step {
    fn mask(&self) -> u8 {
        if self.width == 8 {
            0xFF
        } else {
            ((1u16 << self.width) - 1) as u8
        }
    }
}

/// A layout compiled into extraction steps
#[derive(Debug, Clone)]
pub struct SignalCodec {
    layout: BitLayout,
    steps: Vec<Step>,
}

impl SignalCodec {
    pub fn new(layout: BitLayout) -> Self {
        let steps = if layout.bit_length == 0 || layout.bit_length > 64 {
            Vec::new()
        } else {
            match layout.byte_order {
                SignalByteOrder::Intel => compile_intel(layout),
                SignalByteOrder::Motorola => compile_motorola(layout),
            }
        };
        Self { layout, steps }
    }

    pub fn layout(&self) -> BitLayout {
        self.layout
    }

    /// Number of payload bytes the signal needs
    pub fn required_len(&self) -> usize {
        self.steps
            .iter()
            .map(|s| s.byte_index as usize + 1)
            .max()
            .unwrap_or(0)
    }

    fn fits(&self, dlc: u8) -> bool {
        !self.steps.is_empty() && self.required_len() <= dlc.min(8) as usize
    }

    /// Unsigned raw bits, LSB first
    pub fn extract_raw(&self, data: &[u8]) -> u64 {
        let mut out = 0u64;
        for st in &self.steps {
            if let Some(&b) = data.get(st.byte_index as usize) {
                out |= (((b >> st.src_lsb) & st.mask()) as u64) << st.dst_lsb;
            }
        }
        out
    }

    /// Write raw bits back into the payload; bits outside the layout are kept
    pub fn encode_raw(&self, data: &mut [u8], raw: u64) {
        for st in &self.steps {
            if let Some(b) = data.get_mut(st.byte_index as usize) {
                let mask = st.mask() << st.src_lsb;
                let chunk = ((raw >> st.dst_lsb) as u8 & st.mask()) << st.src_lsb;
                *b = (*b & !mask) | chunk;
            }
        }
    }

    pub fn decode(&self, data: &[u8], dlc: u8, scaling: &Scaling) -> DecodedSignal {
        if self.steps.is_empty() {
            return DecodedSignal::not_available(self.layout, false);
        }
        if !self.fits(dlc) {
            return DecodedSignal::not_available(self.layout, true);
        }

        let bits = self.extract_raw(data);
        let length = self.layout.bit_length;

        if scaling.value_type.is_float() {
            let unscaled = match (scaling.value_type, length) {
                (ValueType::F32, 32) => f32::from_bits(bits as u32) as f64,
                (ValueType::F64, 64) => f64::from_bits(bits),
                // Float type on a non-matching width
                _ => return DecodedSignal::not_available(self.layout, false),
            };
            let text = unscaled.to_string();
            return DecodedSignal {
                value: (unscaled * scaling.factor + scaling.offset).to_string(),
                raw_dec: text.clone(),
                raw_hex: text,
                raw: None,
                dlc_error: false,
                layout: self.layout,
            };
        }

        let raw = if scaling.value_type.is_signed() {
            sign_extend(bits, length)
        } else {
            bits as i64
        };

        let value = match scaling.value_table.get(&raw) {
            Some(text) => text.clone(),
            None if scaling.is_identity() => {
                if scaling.value_type.is_signed() {
                    raw.to_string()
                } else {
                    bits.to_string()
                }
            }
            None => {
                let base = if scaling.value_type.is_signed() {
                    raw as f64
                } else {
                    bits as f64
                };
                (base * scaling.factor + scaling.offset).to_string()
            }
        };

        DecodedSignal {
            value,
            raw_dec: if scaling.value_type.is_signed() {
                raw.to_string()
            } else {
                bits.to_string()
            },
            raw_hex: format!("{:X}", bits),
            raw: Some(raw),
            dlc_error: false,
            layout: self.layout,
        }
    }
}

/// Decode one signal without keeping the compiled steps
pub fn decode_signal(data: &[u8], dlc: u8, layout: BitLayout, scaling: &Scaling) -> DecodedSignal {
    SignalCodec::new(layout).decode(data, dlc, scaling)
}

/// Write a raw integer into a payload at the given layout
pub fn encode_raw(data: &mut [u8], layout: BitLayout, raw: u64) {
    SignalCodec::new(layout).encode_raw(data, raw)
}

fn sign_extend(bits: u64, length: u16) -> i64 {
    let n = length.min(64);
    if n == 0 || n == 64 {
        return bits as i64;
    }
    let sign_bit = 1u64 << (n - 1);
    if bits & sign_bit != 0 {
        (bits | !((1u64 << n) - 1)) as i64
    } else {
        bits as i64
    }
}

fn compile_intel(layout: BitLayout) -> Vec<Step> {
    let mut steps = Vec::new();
    let mut remaining = layout.bit_length;
    let mut bit = layout.start_bit;
    let mut dst = 0u16;

    while remaining > 0 {
        let bit_off = (bit % 8) as u8;
        let take = remaining.min((8 - bit_off) as u16) as u8;
        let Ok(byte_index) = u8::try_from(bit / 8) else {
            break;
        };
        steps.push(Step {
            byte_index,
            src_lsb: bit_off,
            width: take,
            dst_lsb: dst,
        });
        bit += take as u16;
        dst += take as u16;
        remaining -= take as u16;
    }
    steps
}

fn compile_motorola(layout: BitLayout) -> Vec<Step> {
    let mut steps = Vec::new();
    let mut remaining = layout.bit_length;
    let mut byte = (layout.start_bit / 8) as usize;
    let mut bit_msb = (layout.start_bit % 8) as u8;

    while remaining > 0 {
        let Ok(byte_index) = u8::try_from(byte) else {
            break;
        };
        let take = (bit_msb as u16 + 1).min(remaining);
        let src_lsb = bit_msb + 1 - take as u8;
        steps.push(Step {
            byte_index,
            src_lsb,
            width: take as u8,
            dst_lsb: remaining - take,
        });
        remaining -= take;
        byte += 1;
        bit_msb = 7;
    }
    steps
}
