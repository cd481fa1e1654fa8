//! UDS (Unified Diagnostic Services) layer of the diagnostic flashloader
//!
//! Only the services a flashloader session needs are implemented: session
//! control, security access, identifier reads and writes, routines, the
//! download services and ECU reset.

mod error;
mod nrc;
mod services;

pub use error::UdsError;
pub use nrc::NegativeResponseCode;
pub use services::{ecu_reset_request, write_data_by_id_request, UdsService};

/// UDS service ID constants
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const READ_DATA_BY_ID: u8 = 0x22;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const WRITE_DATA_BY_ID: u8 = 0x2E;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const REQUEST_DOWNLOAD: u8 = 0x34;
    pub const TRANSFER_DATA: u8 = 0x36;
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;

    /// Offset added to the service ID in a positive response
    pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;
}

/// DiagnosticSessionControl (0x10) session types
pub mod session_type {
    pub const DEFAULT: u8 = 0x01;
    pub const PROGRAMMING: u8 = 0x02;
}

/// ECUReset (0x11) sub-functions
pub mod reset_type {
    /// Hard reset - complete shutdown and restart of ECU
    pub const HARD_RESET: u8 = 0x01;
    /// Soft reset - application-level restart
    pub const SOFT_RESET: u8 = 0x03;
}

/// RoutineControl (0x31) sub-functions
pub mod routine_sub_function {
    pub const START_ROUTINE: u8 = 0x01;
    pub const STOP_ROUTINE: u8 = 0x02;
    pub const REQUEST_ROUTINE_RESULTS: u8 = 0x03;
}

/// Data identifiers served by the diagnostic flashloader
pub mod flashloader_did {
    /// Device type name, NUL padded ASCII
    pub const DEVICE_NAME: u16 = 0xF197;
    /// Flashloader version text
    pub const FLASHLOADER_VERSION: u16 = 0xF180;
    /// Maximum request payload, u32 BE
    pub const MAX_BLOCK_LENGTH: u16 = 0xA802;
    /// Flash block table, see [`crate::device_info::DiagDeviceInfo`]
    pub const FLASH_BLOCKS: u16 = 0xA810;
    /// Write 0x01 to stay in the flashloader after the next reset
    pub const REQUEST_PROGRAMMING: u16 = 0xA830;
    /// Parameter set image, written as a single block
    pub const PARAMETER_SET: u16 = 0xA840;
    /// Public key material of a certificate
    pub const CERTIFICATE_KEY: u16 = 0xA850;
    /// Security mode, 0x00 off / 0x01 on
    pub const SECURITY_STATE: u16 = 0xA860;
    /// Debugger access, 0x00 off / 0x01 on
    pub const DEBUGGER_STATE: u16 = 0xA861;
}

/// Routine identifiers served by the diagnostic flashloader
pub mod flashloader_routine {
    /// Forward traffic to another bus; parameter: output bus ID
    pub const ROUTING_ENABLE: u16 = 0x0201;
    /// Verify the flash memory after a transfer; result byte 0x00 means valid
    pub const CHECK_FLASH_MEMORY: u16 = 0x0202;
}
