//! Frame replay files
//!
//! One frame per line:
//!
//! ```text
//! <seconds.micros> <id hex>[x] [r] <dlc> <byte hex>...
//! ```
//!
//! `x` marks a 29-bit identifier, `r` a remote frame. Empty lines and lines
//! starting with `#` are skipped.

use anyhow::{bail, Context, Result};
use canflash_core::CanFrame;

const MAX_STANDARD_ID: u32 = 0x7FF;
const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;
const MAX_DLC_CODE: u8 = 15;

/// Parse one line; `None` for blank and comment lines
pub fn parse_line(line: &str) -> Result<Option<CanFrame>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let mut fields = line.split_whitespace();

    let timestamp = fields.next().context("Missing timestamp")?;
    let timestamp_us = parse_timestamp(timestamp)?;

    let id_field = fields.next().context("Missing identifier")?;
    let (id_text, extended) = match id_field.strip_suffix(['x', 'X']) {
        Some(id) => (id, true),
        None => (id_field, false),
    };
    let id = u32::from_str_radix(id_text, 16)
        .with_context(|| format!("Invalid identifier '{}'", id_field))?;
    let max_id = if extended { MAX_EXTENDED_ID } else { MAX_STANDARD_ID };
    if id > max_id {
        bail!("Identifier 0x{:X} out of range", id);
    }

    let mut next = fields.next().context("Missing DLC")?;
    let rtr = next.eq_ignore_ascii_case("r");
    if rtr {
        next = fields.next().context("Missing DLC")?;
    }
    let dlc: u8 = next
        .parse()
        .with_context(|| format!("Invalid DLC '{}'", next))?;
    if dlc > MAX_DLC_CODE {
        bail!("DLC {} out of range", dlc);
    }

    let data = fields
        .map(|b| u8::from_str_radix(b, 16).with_context(|| format!("Invalid data byte '{}'", b)))
        .collect::<Result<Vec<u8>>>()?;
    if data.len() > 8 {
        bail!("{} data bytes, at most 8 allowed", data.len());
    }

    let mut frame = CanFrame::new(id, extended, &data)
        .with_dlc(dlc)
        .with_timestamp(timestamp_us);
    frame.rtr = rtr;
    Ok(Some(frame))
}

/// `12.000345` -> 12_000_345 µs; fractions are cut to microseconds
fn parse_timestamp(text: &str) -> Result<u64> {
    let (seconds, fraction) = text.split_once('.').unwrap_or((text, ""));
    let seconds: u64 = seconds
        .parse()
        .with_context(|| format!("Invalid timestamp '{}'", text))?;
    if !fraction.chars().all(|c| c.is_ascii_digit()) {
        bail!("Invalid timestamp '{}'", text);
    }
    let micros = fraction
        .chars()
        .chain(std::iter::repeat('0'))
        .take(6)
        .collect::<String>()
        .parse::<u64>()
        .with_context(|| format!("Invalid timestamp '{}'", text))?;
    Ok(seconds * 1_000_000 + micros)
}

/// Parse a whole file; errors name the offending line
pub fn parse_frames(content: &str) -> Result<Vec<CanFrame>> {
    let mut frames = Vec::new();
    for (number, line) in content.lines().enumerate() {
        let frame = parse_line(line).with_context(|| format!("Line {}", number + 1))?;
        frames.extend(frame);
    }
    Ok(frames)
}
