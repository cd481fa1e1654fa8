//! Legacy flashloader command set
//!
//! Legacy flashloaders predate the diagnostic protocol. A node is woken into
//! its flashloader by a network-wide reset followed by the `FLASH` wake-up
//! message; afterwards it answers single-byte commands. A positive response
//! echoes the command with [`RESPONSE_FLAG`] set, a rejection is
//! `[ERROR_RESPONSE, command, code]`.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::device_info::{decode_info_blocks, text_from_bytes, InfoBlock, LegacyDeviceInfo};
use crate::transport::{TransportAdapter, TransportError};

/// Legacy command codes
pub mod command {
    /// Broadcast: reset every node on the bus
    pub const NET_RESET: u8 = 0x01;
    pub const GET_DEVICE_NAME: u8 = 0x10;
    pub const GET_FLASHLOADER_VERSION: u8 = 0x11;
    pub const GET_INFO_BLOCKS: u8 = 0x12;
    /// Erase a range: address u32 BE, size u32 BE
    pub const ERASE: u8 = 0x20;
    /// Program data: address u32 BE, data
    pub const WRITE: u8 = 0x21;
    /// Finish programming and verify
    pub const FINISH: u8 = 0x22;
    pub const RESET: u8 = 0x30;
}

/// Wake-up message broadcast after a net reset
pub const WAKE_UP: &[u8] = b"FLASH";

pub const RESPONSE_FLAG: u8 = 0x40;
pub const ERROR_RESPONSE: u8 = 0xFF;

/// Bytes of image data per write command
pub const WRITE_CHUNK_SIZE: usize = 256;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LegacyError {
    #[error("Command 0x{command:02X} rejected with code 0x{code:02X}")]
    Rejected { command: u8, code: u8 },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Command layer on top of one node channel
#[derive(Clone)]
pub struct LegacyService {
    transport: Arc<dyn TransportAdapter>,
    timeout: Duration,
}

impl LegacyService {
    pub fn new(transport: Arc<dyn TransportAdapter>) -> Self {
        Self {
            transport,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn command(
        &self,
        command: u8,
        params: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, LegacyError> {
        let mut request = Vec::with_capacity(params.len() + 1);
        request.push(command);
        request.extend_from_slice(params);

        let response = self.transport.send_receive(&request, timeout).await?;
        match response.first() {
            Some(&ERROR_RESPONSE) => Err(LegacyError::Rejected {
                command,
                code: response.get(2).copied().unwrap_or(0),
            }),
            Some(&echo) if echo == command | RESPONSE_FLAG => Ok(response[1..].to_vec()),
            _ => Err(LegacyError::InvalidResponse(format!(
                "Unexpected response {:02X?} to command 0x{:02X}",
                response, command
            ))),
        }
    }

    pub async fn device_name(&self) -> Result<String, LegacyError> {
        let data = self
            .command(command::GET_DEVICE_NAME, &[], self.timeout)
            .await?;
        Ok(text_from_bytes(&data))
    }

    pub async fn flashloader_version(&self) -> Result<String, LegacyError> {
        let data = self
            .command(command::GET_FLASHLOADER_VERSION, &[], self.timeout)
            .await?;
        Ok(text_from_bytes(&data))
    }

    pub async fn info_blocks(&self) -> Result<Vec<InfoBlock>, LegacyError> {
        let data = self
            .command(command::GET_INFO_BLOCKS, &[], self.timeout)
            .await?;
        decode_info_blocks(&data)
            .ok_or_else(|| LegacyError::InvalidResponse("Malformed info block table".to_string()))
    }

    /// Everything the device info phase reports for a legacy node
    pub async fn read_device_info(&self) -> Result<LegacyDeviceInfo, LegacyError> {
        Ok(LegacyDeviceInfo {
            device_name: self.device_name().await?,
            flashloader_version: self.flashloader_version().await?,
            info_blocks: self.info_blocks().await?,
        })
    }

    pub async fn erase(&self, address: u32, size: u32, timeout: Duration) -> Result<(), LegacyError> {
        let mut params = address.to_be_bytes().to_vec();
        params.extend_from_slice(&size.to_be_bytes());
        self.command(command::ERASE, &params, timeout).await?;
        Ok(())
    }

    pub async fn write(&self, address: u32, data: &[u8], timeout: Duration) -> Result<(), LegacyError> {
        let mut params = Vec::with_capacity(data.len() + 4);
        params.extend_from_slice(&address.to_be_bytes());
        params.extend_from_slice(data);
        self.command(command::WRITE, &params, timeout).await?;
        Ok(())
    }

    pub async fn finish(&self) -> Result<(), LegacyError> {
        self.command(command::FINISH, &[], self.timeout).await?;
        Ok(())
    }

    pub async fn reset(&self) -> Result<(), LegacyError> {
        self.command(command::RESET, &[], self.timeout).await?;
        Ok(())
    }
}
