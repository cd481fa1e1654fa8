//! Trace engine errors

use canflash_core::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TraceError {
    /// Filesystem failure while creating or writing a trace file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Writer used before `open` or after close
    #[error("Trace file is not open")]
    NotOpen,

    #[error("Invalid trace file path: {0}")]
    InvalidPath(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

pub type TraceResult<T> = std::result::Result<T, TraceError>;

impl From<TraceError> for CoreError {
    fn from(err: TraceError) -> Self {
        match err {
            TraceError::Io(e) => CoreError::Io(e.to_string()),
            TraceError::NotOpen => CoreError::Io("Trace file is not open".to_string()),
            TraceError::InvalidPath(p) => CoreError::Io(format!("Invalid trace file path: {}", p)),
            TraceError::Core(e) => e,
        }
    }
}
