//! Negative response codes seen during flashloader sessions

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegativeResponseCode {
    GeneralReject,
    ServiceNotSupported,
    SubFunctionNotSupported,
    IncorrectMessageLengthOrFormat,
    BusyRepeatRequest,
    ConditionsNotCorrect,
    RequestSequenceError,
    NoResponseFromSubnet,
    RequestOutOfRange,
    SecurityAccessDenied,
    InvalidKey,
    ExceededNumberOfAttempts,
    UploadDownloadNotAccepted,
    TransferDataSuspended,
    GeneralProgrammingFailure,
    WrongBlockSequenceCounter,
    ResponsePending,
    SubFunctionNotSupportedInActiveSession,
    ServiceNotSupportedInActiveSession,
    /// Manufacturer specific or reserved
    Other(u8),
}

impl NegativeResponseCode {
    const TABLE: [(u8, NegativeResponseCode); 19] = [
        (0x10, Self::GeneralReject),
        (0x11, Self::ServiceNotSupported),
        (0x12, Self::SubFunctionNotSupported),
        (0x13, Self::IncorrectMessageLengthOrFormat),
        (0x21, Self::BusyRepeatRequest),
        (0x22, Self::ConditionsNotCorrect),
        (0x24, Self::RequestSequenceError),
        (0x25, Self::NoResponseFromSubnet),
        (0x31, Self::RequestOutOfRange),
        (0x33, Self::SecurityAccessDenied),
        (0x35, Self::InvalidKey),
        (0x36, Self::ExceededNumberOfAttempts),
        (0x70, Self::UploadDownloadNotAccepted),
        (0x71, Self::TransferDataSuspended),
        (0x72, Self::GeneralProgrammingFailure),
        (0x73, Self::WrongBlockSequenceCounter),
        (0x78, Self::ResponsePending),
        (0x7E, Self::SubFunctionNotSupportedInActiveSession),
        (0x7F, Self::ServiceNotSupportedInActiveSession),
    ];
}

impl From<u8> for NegativeResponseCode {
    fn from(value: u8) -> Self {
        Self::TABLE
            .iter()
            .find(|(code, _)| *code == value)
            .map(|(_, nrc)| *nrc)
            .unwrap_or(Self::Other(value))
    }
}

impl From<NegativeResponseCode> for u8 {
    fn from(nrc: NegativeResponseCode) -> Self {
        if let NegativeResponseCode::Other(value) = nrc {
            return value;
        }
        NegativeResponseCode::TABLE
            .iter()
            .find(|(_, known)| *known == nrc)
            .map(|(code, _)| *code)
            .unwrap_or(0)
    }
}

impl fmt::UpperHex for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value: u8 = (*self).into();
        fmt::UpperHex::fmt(&value, f)
    }
}

impl fmt::Display for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(v) => write!(f, "Other(0x{:02X})", v),
            known => write!(f, "{:?}", known),
        }
    }
}
