//! Device information read from flashloaders
//!
//! Both flashloader families report a device name and a version text; beyond
//! that the diagnostic flashloader describes its flash blocks (with the
//! result of its own signature check) while the legacy flashloader only
//! exposes free-form info blocks.

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;

/// One flash block of a diagnostic flashloader
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlashBlockInfo {
    pub address: u32,
    pub size: u32,
    /// Result of the node's own signature check of the block content
    pub signature_valid: bool,
    pub application_name: String,
    pub application_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct DiagDeviceInfo {
    pub device_name: String,
    pub flashloader_version: String,
    /// Largest request payload the node accepts
    pub max_block_length: u32,
    pub flash_blocks: Vec<FlashBlockInfo>,
}

/// Info block of a legacy flashloader
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InfoBlock {
    pub address: u32,
    pub project_name: String,
    pub project_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct LegacyDeviceInfo {
    pub device_name: String,
    pub flashloader_version: String,
    pub info_blocks: Vec<InfoBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "family", rename_all = "lowercase")]
pub enum DeviceInfo {
    Legacy(LegacyDeviceInfo),
    Diagnostic(DiagDeviceInfo),
}

impl DeviceInfo {
    pub fn device_name(&self) -> &str {
        match self {
            DeviceInfo::Legacy(info) => &info.device_name,
            DeviceInfo::Diagnostic(info) => &info.device_name,
        }
    }

    pub fn flashloader_version(&self) -> &str {
        match self {
            DeviceInfo::Legacy(info) => &info.flashloader_version,
            DeviceInfo::Diagnostic(info) => &info.flashloader_version,
        }
    }

    /// Whether the node already holds this application
    ///
    /// Diagnostic nodes only count blocks that passed their signature check.
    pub fn has_application(&self, name: &str, version: &str) -> bool {
        match self {
            DeviceInfo::Legacy(info) => info
                .info_blocks
                .iter()
                .any(|b| b.project_name == name && b.project_version == version),
            DeviceInfo::Diagnostic(info) => info.flash_blocks.iter().any(|b| {
                b.signature_valid
                    && b.application_name == name
                    && b.application_version == version
            }),
        }
    }
}

/// Results of the device info phase, one list per flashloader family
///
/// Entries carry the node index in the network description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfos {
    pub diagnostic: Vec<(usize, DiagDeviceInfo)>,
    pub legacy: Vec<(usize, LegacyDeviceInfo)>,
}

impl DeviceInfos {
    pub fn is_empty(&self) -> bool {
        self.diagnostic.is_empty() && self.legacy.is_empty()
    }

    pub fn len(&self) -> usize {
        self.diagnostic.len() + self.legacy.len()
    }
}

// =============================================================================
// Wire encoding
// =============================================================================

/// Text from a NUL padded or length prefixed field
pub fn text_from_bytes(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}

fn put_text(buf: &mut BytesMut, text: &str) {
    let bytes = text.as_bytes();
    let len = bytes.len().min(u8::MAX as usize);
    buf.put_u8(len as u8);
    buf.put_slice(&bytes[..len]);
}

fn get_text(buf: &mut &[u8]) -> Option<String> {
    if buf.remaining() < 1 {
        return None;
    }
    let len = buf.get_u8() as usize;
    if buf.remaining() < len {
        return None;
    }
    let text = text_from_bytes(&buf[..len]);
    buf.advance(len);
    Some(text)
}

/// Flash block table: count u8, then per block address u32 BE, size u32 BE,
/// signature flag u8, name and version as length prefixed text
pub fn encode_flash_blocks(blocks: &[FlashBlockInfo]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(blocks.len().min(u8::MAX as usize) as u8);
    for block in blocks.iter().take(u8::MAX as usize) {
        buf.put_u32(block.address);
        buf.put_u32(block.size);
        buf.put_u8(block.signature_valid as u8);
        put_text(&mut buf, &block.application_name);
        put_text(&mut buf, &block.application_version);
    }
    buf.to_vec()
}

pub fn decode_flash_blocks(data: &[u8]) -> Option<Vec<FlashBlockInfo>> {
    let mut buf = data;
    if buf.remaining() < 1 {
        return None;
    }
    let count = buf.get_u8();
    let mut blocks = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if buf.remaining() < 9 {
            return None;
        }
        let address = buf.get_u32();
        let size = buf.get_u32();
        let signature_valid = buf.get_u8() != 0;
        let application_name = get_text(&mut buf)?;
        let application_version = get_text(&mut buf)?;
        blocks.push(FlashBlockInfo {
            address,
            size,
            signature_valid,
            application_name,
            application_version,
        });
    }
    Some(blocks)
}

/// Info block table: count u8, then per block address u32 BE and name and
/// version as length prefixed text
pub fn encode_info_blocks(blocks: &[InfoBlock]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(blocks.len().min(u8::MAX as usize) as u8);
    for block in blocks.iter().take(u8::MAX as usize) {
        buf.put_u32(block.address);
        put_text(&mut buf, &block.project_name);
        put_text(&mut buf, &block.project_version);
    }
    buf.to_vec()
}

pub fn decode_info_blocks(data: &[u8]) -> Option<Vec<InfoBlock>> {
    let mut buf = data;
    if buf.remaining() < 1 {
        return None;
    }
    let count = buf.get_u8();
    let mut blocks = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if buf.remaining() < 4 {
            return None;
        }
        let address = buf.get_u32();
        let project_name = get_text(&mut buf)?;
        let project_version = get_text(&mut buf)?;
        blocks.push(InfoBlock {
            address,
            project_name,
            project_version,
        });
    }
    Some(blocks)
}
