//! Update sequence errors

use canflash_core::CoreError;
use thiserror::Error;

use crate::image::ImageError;
use crate::legacy::LegacyError;
use crate::pem::PemError;
use crate::transport::TransportError;
use crate::uds::{NegativeResponseCode, UdsError};

pub type UpdateResult<T> = Result<T, UpdateError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UpdateError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Device name mismatch: file is for '{expected}', node reports '{actual}'")]
    DeviceNameMismatch { expected: String, actual: String },

    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("Memory range error: {0}")]
    MemoryRange(String),

    #[error("Sequence busy")]
    Busy,

    #[error("Aborted")]
    Aborted,

    /// Failure while writing a file, with its position in the update order
    #[error("Node position {node_position}, file {file_index}: {source}")]
    AtFile {
        node_position: usize,
        file_index: usize,
        source: Box<UpdateError>,
    },
}

impl UpdateError {
    pub fn at_file(self, node_position: usize, file_index: usize) -> Self {
        match self {
            // Aborts are not attributed to a file
            UpdateError::Aborted | UpdateError::AtFile { .. } => self,
            other => UpdateError::AtFile {
                node_position,
                file_index,
                source: Box::new(other),
            },
        }
    }

    /// `(node position, file index)` of a failed update
    pub fn failure_position(&self) -> Option<(usize, usize)> {
        match self {
            UpdateError::AtFile {
                node_position,
                file_index,
                ..
            } => Some((*node_position, *file_index)),
            _ => None,
        }
    }

    /// The error without its position
    pub fn root(&self) -> &UpdateError {
        match self {
            UpdateError::AtFile { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<UpdateError> for CoreError {
    fn from(err: UpdateError) -> Self {
        match err {
            UpdateError::Config(msg) => CoreError::Config(msg),
            UpdateError::Io(msg) => CoreError::Io(msg),
            UpdateError::Communication(msg) => CoreError::Communication(msg),
            e @ (UpdateError::DeviceNameMismatch { .. }
            | UpdateError::SignatureInvalid(_)
            | UpdateError::MemoryRange(_)) => CoreError::ProtocolMismatch(e.to_string()),
            UpdateError::Busy => CoreError::Busy,
            UpdateError::Aborted => CoreError::Aborted,
            UpdateError::AtFile { source, .. } => CoreError::from(*source),
        }
    }
}

impl From<std::io::Error> for UpdateError {
    fn from(err: std::io::Error) -> Self {
        UpdateError::Io(err.to_string())
    }
}

impl From<TransportError> for UpdateError {
    fn from(err: TransportError) -> Self {
        UpdateError::Communication(err.to_string())
    }
}

impl From<UdsError> for UpdateError {
    fn from(err: UdsError) -> Self {
        match err.nrc() {
            Some(NegativeResponseCode::RequestOutOfRange) => {
                UpdateError::MemoryRange(err.to_string())
            }
            _ => UpdateError::Communication(err.to_string()),
        }
    }
}

impl From<LegacyError> for UpdateError {
    fn from(err: LegacyError) -> Self {
        UpdateError::Communication(err.to_string())
    }
}

impl From<ImageError> for UpdateError {
    fn from(err: ImageError) -> Self {
        match err {
            ImageError::SignatureMismatch { .. } => UpdateError::SignatureInvalid(err.to_string()),
            ImageError::InvalidFormat(_) => UpdateError::Config(err.to_string()),
        }
    }
}

impl From<PemError> for UpdateError {
    fn from(err: PemError) -> Self {
        UpdateError::Config(err.to_string())
    }
}
