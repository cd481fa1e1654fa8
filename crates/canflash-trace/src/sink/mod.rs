//! Trace file writers
//!
//! A closed set of formats behind [`TraceWriter`]. Every writer goes through
//! the same lifecycle: closed, `open` writes the header, `add_message` appends
//! one record per frame, and close (explicit or on drop) writes the footer.

mod asc;
mod blf;

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{TraceError, TraceResult};
use crate::interpreted::InterpretedFrame;

pub use asc::AscWriter;
pub use blf::BlfWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceFormat {
    /// Vector ASCII trace
    Asc,
    /// Vector binary logging format
    Blf,
}

impl TraceFormat {
    pub fn extension(self) -> &'static str {
        match self {
            TraceFormat::Asc => "asc",
            TraceFormat::Blf => "blf",
        }
    }

    /// Format implied by a path's extension
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "asc" => Some(TraceFormat::Asc),
            "blf" => Some(TraceFormat::Blf),
            _ => None,
        }
    }
}

/// Rendering options shared by all formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceOptions {
    /// Identifiers and data in hex instead of decimal
    pub hex: bool,
    /// Absolute timestamps instead of time since the previous frame
    pub absolute_timestamps: bool,
    /// Channel number written into every record
    pub channel: u16,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self {
            hex: true,
            absolute_timestamps: true,
            channel: 1,
        }
    }
}

pub trait TraceWriter {
    /// Create the file and write the header; returns the final path
    fn open(&mut self, path: &Path) -> TraceResult<PathBuf>;

    /// Append one frame; does nothing when the file is not open
    fn add_message(&mut self, frame: &InterpretedFrame) -> TraceResult<()>;

    /// Write the footer and release the file
    fn close(&mut self) -> TraceResult<()>;

    fn is_open(&self) -> bool;

    fn path(&self) -> Option<&Path>;
}

#[derive(Debug)]
pub enum TraceSink {
    Asc(AscWriter),
    Blf(BlfWriter),
}

impl TraceSink {
    pub fn new(format: TraceFormat, options: TraceOptions) -> Self {
        match format {
            TraceFormat::Asc => TraceSink::Asc(AscWriter::new(options)),
            TraceFormat::Blf => TraceSink::Blf(BlfWriter::new(options)),
        }
    }

    pub fn format(&self) -> TraceFormat {
        match self {
            TraceSink::Asc(_) => TraceFormat::Asc,
            TraceSink::Blf(_) => TraceFormat::Blf,
        }
    }

    fn writer(&mut self) -> &mut dyn TraceWriter {
        match self {
            TraceSink::Asc(w) => w,
            TraceSink::Blf(w) => w,
        }
    }
}

impl TraceWriter for TraceSink {
    fn open(&mut self, path: &Path) -> TraceResult<PathBuf> {
        self.writer().open(path)
    }

    fn add_message(&mut self, frame: &InterpretedFrame) -> TraceResult<()> {
        self.writer().add_message(frame)
    }

    fn close(&mut self) -> TraceResult<()> {
        self.writer().close()
    }

    fn is_open(&self) -> bool {
        match self {
            TraceSink::Asc(w) => w.is_open(),
            TraceSink::Blf(w) => w.is_open(),
        }
    }

    fn path(&self) -> Option<&Path> {
        match self {
            TraceSink::Asc(w) => w.path(),
            TraceSink::Blf(w) => w.path(),
        }
    }
}

/// Enforce the extension, create parent directories and remove a stale file
pub(crate) fn prepare_path(path: &Path, format: TraceFormat) -> TraceResult<PathBuf> {
    if path.file_name().is_none() {
        return Err(TraceError::InvalidPath(path.display().to_string()));
    }

    let path = if TraceFormat::from_path(path) == Some(format) {
        path.to_path_buf()
    } else {
        let mut name = path.as_os_str().to_owned();
        name.push(".");
        name.push(format.extension());
        PathBuf::from(name)
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    if path.exists() {
        debug!(path = %path.display(), "Removing existing trace file");
        fs::remove_file(&path)?;
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_is_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = prepare_path(&dir.path().join("a/b/trace.txt"), TraceFormat::Asc).unwrap();
        assert_eq!(path.file_name().unwrap(), "trace.txt.asc");
        assert!(path.parent().unwrap().is_dir());

        let path = prepare_path(&dir.path().join("log.BLF"), TraceFormat::Blf).unwrap();
        assert_eq!(path.file_name().unwrap(), "log.BLF");
    }

    #[test]
    fn test_existing_file_removed() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("old.asc");
        fs::write(&target, "stale").unwrap();
        let path = prepare_path(&target, TraceFormat::Asc).unwrap();
        assert_eq!(path, target);
        assert!(!target.exists());
    }

    #[test]
    fn test_sink_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = TraceSink::new(TraceFormat::Blf, TraceOptions::default());
        assert_eq!(sink.format(), TraceFormat::Blf);
        assert!(!sink.is_open());

        let path = sink.open(&dir.path().join("x")).unwrap();
        assert_eq!(path.extension().unwrap(), "blf");
        assert!(sink.is_open());
        assert_eq!(sink.path(), Some(path.as_path()));

        sink.close().unwrap();
        assert!(!sink.is_open());
    }
}
