//! UDS protocol errors

use thiserror::Error;

use super::NegativeResponseCode;
use crate::transport::TransportError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UdsError {
    #[error("Negative response: {nrc} (0x{nrc:02X}) for service 0x{service_id:02X}")]
    NegativeResponse {
        service_id: u8,
        nrc: NegativeResponseCode,
    },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Response timeout")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Security access failed: {0}")]
    SecurityAccessFailed(String),
}

impl UdsError {
    /// Negative response code, if the node answered negatively
    pub fn nrc(&self) -> Option<NegativeResponseCode> {
        match self {
            UdsError::NegativeResponse { nrc, .. } => Some(*nrc),
            _ => None,
        }
    }
}
