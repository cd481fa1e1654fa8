//! Vector binary logging format writer
//!
//! Objects are written uncompressed, one `CAN_MESSAGE` object per frame. The
//! file header is written on open and rewritten on close with the final
//! object count and file size. All fields are little endian.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{BufMut, BytesMut};
use chrono::{Datelike, Local, NaiveDateTime, Timelike};
use tracing::{info, warn};

use super::{prepare_path, TraceFormat, TraceOptions, TraceWriter};
use crate::error::TraceResult;
use crate::interpreted::InterpretedFrame;

pub(crate) const FILE_HEADER_SIZE: usize = 144;
pub(crate) const CAN_MESSAGE_SIZE: usize = 48;

const FILE_SIGNATURE: &[u8; 4] = b"LOGG";
const OBJECT_SIGNATURE: &[u8; 4] = b"LOBJ";
const OBJECT_HEADER_SIZE: u16 = 32;
const OBJECT_HEADER_VERSION: u16 = 1;
const OBJECT_TYPE_CAN_MESSAGE: u32 = 1;
const OBJECT_FLAG_TIME_ONE_NANS: u32 = 0x02;

const APPLICATION_ID: u8 = 0;
const APPLICATION_VERSION: [u8; 3] = [0, 1, 0];
const BINLOG_VERSION: [u8; 4] = [4, 7, 1, 0];

pub(crate) const MSG_FLAG_TX: u8 = 0x01;
pub(crate) const MSG_FLAG_RTR: u8 = 0x80;
pub(crate) const EXTENDED_ID_FLAG: u32 = 0x8000_0000;

#[derive(Debug)]
pub struct BlfWriter {
    options: TraceOptions,
    out: Option<BufWriter<File>>,
    path: Option<PathBuf>,
    start: Option<NaiveDateTime>,
    object_count: u32,
    file_size: u64,
}

impl BlfWriter {
    pub fn new(options: TraceOptions) -> Self {
        Self {
            options,
            out: None,
            path: None,
            start: None,
            object_count: 0,
            file_size: 0,
        }
    }

    pub fn object_count(&self) -> u32 {
        self.object_count
    }
}

/// Windows SYSTEMTIME layout
fn put_system_time(buf: &mut BytesMut, time: Option<NaiveDateTime>) {
    let Some(t) = time else {
        buf.put_bytes(0, 16);
        return;
    };
    buf.put_u16_le(t.year() as u16);
    buf.put_u16_le(t.month() as u16);
    buf.put_u16_le(t.weekday().num_days_from_sunday() as u16);
    buf.put_u16_le(t.day() as u16);
    buf.put_u16_le(t.hour() as u16);
    buf.put_u16_le(t.minute() as u16);
    buf.put_u16_le(t.second() as u16);
    buf.put_u16_le((t.nanosecond() / 1_000_000).min(999) as u16);
}

pub(crate) fn file_header(
    object_count: u32,
    file_size: u64,
    start: Option<NaiveDateTime>,
    stop: Option<NaiveDateTime>,
) -> BytesMut {
    let mut buf = BytesMut::with_capacity(FILE_HEADER_SIZE);
    buf.put_slice(FILE_SIGNATURE);
    buf.put_u32_le(FILE_HEADER_SIZE as u32);
    buf.put_u8(APPLICATION_ID);
    buf.put_slice(&APPLICATION_VERSION);
    buf.put_slice(&BINLOG_VERSION);
    buf.put_u64_le(file_size);
    // Uncompressed size equals file size
    buf.put_u64_le(file_size);
    buf.put_u32_le(object_count);
    // Objects read
    buf.put_u32_le(object_count);
    put_system_time(&mut buf, start);
    put_system_time(&mut buf, stop);
    buf.put_bytes(0, FILE_HEADER_SIZE - buf.len());
    buf
}

pub(crate) fn can_message(frame: &InterpretedFrame, channel: u16) -> BytesMut {
    let raw = &frame.frame;
    let mut buf = BytesMut::with_capacity(CAN_MESSAGE_SIZE);

    // Object header
    buf.put_slice(OBJECT_SIGNATURE);
    buf.put_u16_le(OBJECT_HEADER_SIZE);
    buf.put_u16_le(OBJECT_HEADER_VERSION);
    buf.put_u32_le(CAN_MESSAGE_SIZE as u32);
    buf.put_u32_le(OBJECT_TYPE_CAN_MESSAGE);
    buf.put_u32_le(OBJECT_FLAG_TIME_ONE_NANS);
    // Client index, object version
    buf.put_u16_le(0);
    buf.put_u16_le(0);
    buf.put_u64_le(raw.timestamp_us.saturating_mul(1_000));

    // CAN_MESSAGE body
    let mut flags = 0u8;
    if raw.tx {
        flags |= MSG_FLAG_TX;
    }
    if raw.rtr {
        flags |= MSG_FLAG_RTR;
    }
    let mut id = raw.id & 0x1FFF_FFFF;
    if raw.extended {
        id |= EXTENDED_ID_FLAG;
    }
    buf.put_u16_le(channel);
    buf.put_u8(flags);
    buf.put_u8(raw.dlc);
    buf.put_u32_le(id);
    buf.put_slice(&raw.data);
    buf
}

impl TraceWriter for BlfWriter {
    fn open(&mut self, path: &Path) -> TraceResult<PathBuf> {
        self.close()?;
        let path = prepare_path(path, TraceFormat::Blf)?;
        let mut out = BufWriter::new(File::create(&path)?);

        let start = Local::now().naive_local();
        out.write_all(&file_header(0, FILE_HEADER_SIZE as u64, Some(start), None))?;

        info!(path = %path.display(), "BLF trace opened");
        self.out = Some(out);
        self.path = Some(path.clone());
        self.start = Some(start);
        self.object_count = 0;
        self.file_size = FILE_HEADER_SIZE as u64;
        Ok(path)
    }

    fn add_message(&mut self, frame: &InterpretedFrame) -> TraceResult<()> {
        let Some(out) = self.out.as_mut() else {
            return Ok(());
        };
        out.write_all(&can_message(frame, self.options.channel))?;
        self.object_count = self.object_count.saturating_add(1);
        self.file_size += CAN_MESSAGE_SIZE as u64;
        Ok(())
    }

    fn close(&mut self) -> TraceResult<()> {
        let Some(mut out) = self.out.take() else {
            return Ok(());
        };
        let stop = Local::now().naive_local();
        out.seek(SeekFrom::Start(0))?;
        out.write_all(&file_header(
            self.object_count,
            self.file_size,
            self.start,
            Some(stop),
        ))?;
        out.flush()?;
        info!(
            path = ?self.path,
            objects = self.object_count,
            bytes = self.file_size,
            "BLF trace closed"
        );
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.out.is_some()
    }

    fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Drop for BlfWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to finish BLF trace");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canflash_core::CanFrame;

    fn u32_at(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    fn u64_at(bytes: &[u8], offset: usize) -> u64 {
        u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
    }

    #[test]
    fn test_record_layout() {
        let mut raw = CanFrame::new(0x18FECA00, true, &[1, 2, 3]);
        raw.tx = true;
        raw.rtr = true;
        raw.timestamp_us = 2_001_500;
        let mut frame = InterpretedFrame::new(raw);
        frame.absolute_us = 1_500;

        let record = can_message(&frame, 2);
        assert_eq!(record.len(), CAN_MESSAGE_SIZE);
        assert_eq!(&record[..4], b"LOBJ");
        assert_eq!(u32_at(&record, 8), CAN_MESSAGE_SIZE as u32);
        assert_eq!(u32_at(&record, 12), OBJECT_TYPE_CAN_MESSAGE);
        // Source time, not time since the first frame
        assert_eq!(u64_at(&record, 24), 2_001_500_000);
        assert_eq!(u16::from_le_bytes([record[32], record[33]]), 2);
        assert_eq!(record[34], MSG_FLAG_TX | MSG_FLAG_RTR);
        assert_eq!(record[35], 3);
        assert_eq!(u32_at(&record, 36), 0x18FECA00 | EXTENDED_ID_FLAG);
        assert_eq!(&record[40..43], &[1, 2, 3]);
    }

    #[test]
    fn test_header_size() {
        let header = file_header(3, 288, None, None);
        assert_eq!(header.len(), FILE_HEADER_SIZE);
        assert_eq!(&header[..4], b"LOGG");
        assert_eq!(u64_at(&header, 16), 288);
        assert_eq!(u32_at(&header, 32), 3);
    }

    #[test]
    fn test_close_patches_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = BlfWriter::new(TraceOptions::default());
        let path = writer.open(&dir.path().join("trace.blf")).unwrap();

        let frame = InterpretedFrame::new(CanFrame::new(0x100, false, &[0xAA; 8]));
        writer.add_message(&frame).unwrap();
        writer.add_message(&frame).unwrap();
        assert_eq!(writer.object_count(), 2);
        writer.close().unwrap();

        let bytes = std::fs::read(path).unwrap();
        assert_eq!(bytes.len(), FILE_HEADER_SIZE + 2 * CAN_MESSAGE_SIZE);
        assert_eq!(u64_at(&bytes, 16), bytes.len() as u64);
        assert_eq!(u32_at(&bytes, 32), 2);
        assert_eq!(&bytes[FILE_HEADER_SIZE..FILE_HEADER_SIZE + 4], b"LOBJ");
        assert_eq!(u32_at(&bytes, FILE_HEADER_SIZE + 36), 0x100);
    }
}
