//! Vector ASCII trace writer

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::{info, warn};

use super::{prepare_path, TraceFormat, TraceOptions, TraceWriter};
use crate::error::TraceResult;
use crate::interpreted::{format_seconds, InterpretedFrame};

const DATE_FORMAT: &str = "%a %b %d %H:%M:%S%.3f %Y";

#[derive(Debug)]
pub struct AscWriter {
    options: TraceOptions,
    out: Option<BufWriter<File>>,
    path: Option<PathBuf>,
}

impl AscWriter {
    pub fn new(options: TraceOptions) -> Self {
        Self {
            options,
            out: None,
            path: None,
        }
    }

    pub(crate) fn header(&self, now: DateTime<Local>) -> String {
        let date = now.format(DATE_FORMAT);
        format!(
            "date {date}\n\
             base {} timestamps {}\n\
             no internal events logged\n\
             // version 9.0.0\n\
             Begin Triggerblock {date}\n",
            if self.options.hex { "hex" } else { "dec" },
            if self.options.absolute_timestamps {
                "absolute"
            } else {
                "relative"
            },
        )
    }

    /// Record line plus comment lines of one frame
    pub(crate) fn format_record(&self, frame: &InterpretedFrame) -> String {
        let hex = self.options.hex;
        let raw = &frame.frame;

        let stamp = if self.options.absolute_timestamps {
            frame.absolute_us
        } else {
            frame.relative_us
        };

        let mut id = if hex {
            format!("{:X}", raw.id)
        } else {
            raw.id.to_string()
        };
        if raw.extended {
            id.push('x');
        }

        let direction = if raw.tx { "Tx" } else { "Rx" };
        let mut out = if raw.rtr {
            format!(
                "{:>9} {:<2} {:<15} {:<4} r {}",
                format_seconds(stamp),
                self.options.channel,
                id,
                direction,
                raw.dlc
            )
        } else {
            let data = if hex { &frame.data_hex } else { &frame.data_dec };
            format!(
                "{:>9} {:<2} {:<15} {:<4} d {} {}",
                format_seconds(stamp),
                self.options.channel,
                id,
                direction,
                raw.dlc,
                data
            )
        };
        // Zero-length frames leave a trailing blank
        out.truncate(out.trim_end().len());
        out.push('\n');

        let protocol = frame.protocol_text(hex);
        if !protocol.is_empty() {
            out.push_str(&format!("//   {}\n", protocol));
        }
        if !frame.message_name.is_empty() {
            out.push_str(&format!("//   Message: {}", frame.message_name));
            if frame.dlc_error {
                out.push_str(" (DLC error)");
            }
            out.push('\n');
        }
        if !frame.status.is_empty() {
            out.push_str(&format!("//   Status: {}\n", frame.status));
        }
        for signal in &frame.signals {
            let line = format!("//     {} = {} {}", signal.name, signal.value, signal.unit);
            out.push_str(line.trim_end());
            out.push('\n');
        }
        out
    }
}

impl TraceWriter for AscWriter {
    fn open(&mut self, path: &Path) -> TraceResult<PathBuf> {
        self.close()?;
        let path = prepare_path(path, TraceFormat::Asc)?;
        let mut out = BufWriter::new(File::create(&path)?);
        out.write_all(self.header(Local::now()).as_bytes())?;

        info!(path = %path.display(), hex = self.options.hex, "ASC trace opened");
        self.out = Some(out);
        self.path = Some(path.clone());
        Ok(path)
    }

    fn add_message(&mut self, frame: &InterpretedFrame) -> TraceResult<()> {
        if self.out.is_none() {
            return Ok(());
        }
        let record = self.format_record(frame);
        if let Some(out) = self.out.as_mut() {
            out.write_all(record.as_bytes())?;
        }
        Ok(())
    }

    fn close(&mut self) -> TraceResult<()> {
        if let Some(mut out) = self.out.take() {
            out.write_all(b"End TriggerBlock\n")?;
            out.flush()?;
            info!(path = ?self.path, "ASC trace closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.out.is_some()
    }

    fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Drop for AscWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to finish ASC trace");
        }
    }
}
