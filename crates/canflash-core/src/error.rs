//! Common error types for the canflash engines

use thiserror::Error;

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Error kinds shared by the interpretation and update engines
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Missing or invalid topology reference, index out of range
    #[error("Configuration error: {0}")]
    Config(String),

    /// File create/open/delete failure
    #[error("I/O error: {0}")]
    Io(String),

    /// Session, reconnect or transport failure, reachability loss
    #[error("Communication error: {0}")]
    Communication(String),

    /// Wrong device identity, invalid signature, memory range check failed
    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// A sequence is already running
    #[error("Sequence busy")]
    Busy,

    /// User-requested cancellation
    #[error("Aborted")]
    Aborted,
}

impl CoreError {
    /// Result code reported through progress events
    pub fn result_code(&self) -> ResultCode {
        match self {
            CoreError::Config(_) => ResultCode::Config,
            CoreError::Io(_) => ResultCode::Io,
            CoreError::Communication(_) => ResultCode::Communication,
            CoreError::ProtocolMismatch(_) => ResultCode::ProtocolMismatch,
            CoreError::Busy => ResultCode::Busy,
            CoreError::Aborted => ResultCode::Aborted,
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Io(err.to_string())
    }
}

/// Outcome code attached to every progress event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Ok,
    Config,
    Io,
    Communication,
    ProtocolMismatch,
    Busy,
    Aborted,
}

impl ResultCode {
    pub fn is_ok(self) -> bool {
        self == ResultCode::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_mapping() {
        assert_eq!(
            CoreError::Config("x".into()).result_code(),
            ResultCode::Config
        );
        assert_eq!(CoreError::Busy.result_code(), ResultCode::Busy);
        assert_eq!(CoreError::Aborted.result_code(), ResultCode::Aborted);
        assert!(ResultCode::Ok.is_ok());
        assert!(!ResultCode::Io.is_ok());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: CoreError = io.into();
        assert!(matches!(err, CoreError::Io(msg) if msg.contains("missing")));
    }
}
