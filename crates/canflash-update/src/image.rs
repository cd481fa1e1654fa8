//! Firmware image container
//!
//! Layout, all integers big endian:
//!
//! | field | size |
//! |---|---|
//! | magic `CFLASH_FW\0` | 10 |
//! | device name, NUL padded | 32 |
//! | application name | 32 |
//! | application version | 16 |
//! | area count | 2 |
//! | per area: address, size, data | 4 + 4 + size |
//! | CRC-32/ISO-HDLC of everything above | 4 |
//! | magic `CFW_END\0` | 8 |

use bytes::{Buf, BufMut, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use thiserror::Error;

use crate::device_info::text_from_bytes;

pub const HEADER_MAGIC: &[u8; 10] = b"CFLASH_FW\0";
pub const TRAILER_MAGIC: &[u8; 8] = b"CFW_END\0";

const DEVICE_NAME_LEN: usize = 32;
const APPLICATION_NAME_LEN: usize = 32;
const VERSION_LEN: usize = 16;
const HEADER_LEN: usize = HEADER_MAGIC.len() + DEVICE_NAME_LEN + APPLICATION_NAME_LEN + VERSION_LEN + 2;
const TRAILER_LEN: usize = 4 + TRAILER_MAGIC.len();

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ImageError {
    #[error("Invalid firmware image: {0}")]
    InvalidFormat(String),

    #[error("Signature mismatch: stored 0x{stored:08X}, computed 0x{computed:08X}")]
    SignatureMismatch { stored: u32, computed: u32 },
}

/// Contiguous memory range of an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryArea {
    pub address: u32,
    pub data: Vec<u8>,
}

impl MemoryArea {
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    pub device_name: String,
    pub application_name: String,
    pub application_version: String,
    pub areas: Vec<MemoryArea>,
    stored_crc: u32,
    computed_crc: u32,
}

impl FirmwareImage {
    /// Parse the container structure; the signature is checked separately
    pub fn parse(bytes: &[u8]) -> Result<Self, ImageError> {
        if bytes.len() < HEADER_LEN + TRAILER_LEN {
            return Err(ImageError::InvalidFormat(format!(
                "{} bytes is shorter than header and trailer",
                bytes.len()
            )));
        }
        if !bytes.starts_with(HEADER_MAGIC) {
            return Err(ImageError::InvalidFormat("Missing header magic".to_string()));
        }
        if !bytes.ends_with(TRAILER_MAGIC) {
            return Err(ImageError::InvalidFormat("Missing trailer magic".to_string()));
        }

        let body_end = bytes.len() - TRAILER_LEN;
        let body = &bytes[..body_end];
        let mut crc_field = &bytes[body_end..body_end + 4];
        let stored_crc = crc_field.get_u32();

        let mut buf = &body[HEADER_MAGIC.len()..];
        let device_name = text_from_bytes(&buf[..DEVICE_NAME_LEN]);
        buf.advance(DEVICE_NAME_LEN);
        let application_name = text_from_bytes(&buf[..APPLICATION_NAME_LEN]);
        buf.advance(APPLICATION_NAME_LEN);
        let application_version = text_from_bytes(&buf[..VERSION_LEN]);
        buf.advance(VERSION_LEN);

        let area_count = buf.get_u16();
        let mut areas = Vec::with_capacity(area_count as usize);
        for index in 0..area_count {
            if buf.remaining() < 8 {
                return Err(ImageError::InvalidFormat(format!(
                    "Area {} header truncated",
                    index
                )));
            }
            let address = buf.get_u32();
            let size = buf.get_u32() as usize;
            if buf.remaining() < size {
                return Err(ImageError::InvalidFormat(format!(
                    "Area {} declares {} bytes, {} left",
                    index,
                    size,
                    buf.remaining()
                )));
            }
            areas.push(MemoryArea {
                address,
                data: buf[..size].to_vec(),
            });
            buf.advance(size);
        }
        if buf.has_remaining() {
            return Err(ImageError::InvalidFormat(format!(
                "{} trailing bytes after last area",
                buf.remaining()
            )));
        }

        Ok(Self {
            device_name,
            application_name,
            application_version,
            areas,
            stored_crc,
            computed_crc: CRC32.checksum(body),
        })
    }

    pub fn verify_signature(&self) -> Result<(), ImageError> {
        if self.stored_crc != self.computed_crc {
            return Err(ImageError::SignatureMismatch {
                stored: self.stored_crc,
                computed: self.computed_crc,
            });
        }
        Ok(())
    }

    pub fn total_size(&self) -> u64 {
        self.areas.iter().map(|a| a.data.len() as u64).sum()
    }
}

/// Assembles image files, used by tools and tests
#[derive(Debug, Clone, Default)]
pub struct FirmwareImageBuilder {
    device_name: String,
    application_name: String,
    application_version: String,
    areas: Vec<MemoryArea>,
}

impl FirmwareImageBuilder {
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            ..Default::default()
        }
    }

    pub fn application(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.application_name = name.into();
        self.application_version = version.into();
        self
    }

    pub fn area(mut self, address: u32, data: impl Into<Vec<u8>>) -> Self {
        self.areas.push(MemoryArea {
            address,
            data: data.into(),
        });
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_slice(HEADER_MAGIC);
        put_padded(&mut buf, &self.device_name, DEVICE_NAME_LEN);
        put_padded(&mut buf, &self.application_name, APPLICATION_NAME_LEN);
        put_padded(&mut buf, &self.application_version, VERSION_LEN);
        buf.put_u16(self.areas.len() as u16);
        for area in &self.areas {
            buf.put_u32(area.address);
            buf.put_u32(area.size());
            buf.put_slice(&area.data);
        }
        let crc = CRC32.checksum(&buf);
        buf.put_u32(crc);
        buf.put_slice(TRAILER_MAGIC);
        buf.to_vec()
    }
}

fn put_padded(buf: &mut BytesMut, text: &str, len: usize) {
    let bytes = text.as_bytes();
    let used = bytes.len().min(len);
    buf.put_slice(&bytes[..used]);
    buf.put_bytes(0, len - used);
}
