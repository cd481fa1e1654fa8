//! Update sequence configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::uds::session_type;

/// Configuration of the update sequence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateConfig {
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Security access used after entering the programming session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<SecurityConfig>,
    #[serde(default)]
    pub sessions: SessionConfig,
    /// First TransferData block sequence counter
    #[serde(default = "default_block_counter_start")]
    pub block_counter_start: u8,
    /// Counter value following 0xFF
    #[serde(default)]
    pub block_counter_wrap: u8,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            security: None,
            sessions: SessionConfig::default(),
            block_counter_start: default_block_counter_start(),
            block_counter_wrap: 0,
        }
    }
}

fn default_block_counter_start() -> u8 {
    1
}

impl UpdateConfig {
    /// Block counter following `counter`
    pub fn next_block_counter(&self, counter: u8) -> u8 {
        if counter == u8::MAX {
            self.block_counter_wrap
        } else {
            counter + 1
        }
    }
}

// =============================================================================
// Timeouts
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Default request/response timeout
    #[serde(default = "default_request_ms")]
    pub request_ms: u64,
    /// RequestDownload erases flash and takes longer
    #[serde(default = "default_request_download_ms")]
    pub request_download_ms: u64,
    #[serde(default = "default_transfer_data_ms")]
    pub transfer_data_ms: u64,
    /// Time nodes need to restart into the flashloader
    #[serde(default = "default_flashloader_reset_wait_ms")]
    pub flashloader_reset_wait_ms: u64,
    /// Wait after the final reset broadcast
    #[serde(default = "default_reset_settle_ms")]
    pub reset_settle_ms: u64,
}

fn default_request_ms() -> u64 {
    1000
}

fn default_request_download_ms() -> u64 {
    20000
}

fn default_transfer_data_ms() -> u64 {
    5000
}

fn default_flashloader_reset_wait_ms() -> u64 {
    1500
}

fn default_reset_settle_ms() -> u64 {
    500
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_ms: default_request_ms(),
            request_download_ms: default_request_download_ms(),
            transfer_data_ms: default_transfer_data_ms(),
            flashloader_reset_wait_ms: default_flashloader_reset_wait_ms(),
            reset_settle_ms: default_reset_settle_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    pub fn request_download(&self) -> Duration {
        Duration::from_millis(self.request_download_ms)
    }

    pub fn transfer_data(&self) -> Duration {
        Duration::from_millis(self.transfer_data_ms)
    }

    pub fn flashloader_reset_wait(&self) -> Duration {
        Duration::from_millis(self.flashloader_reset_wait_ms)
    }

    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }
}

// =============================================================================
// Sessions and security
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityConfig {
    /// Security level (1 = sub-functions 0x01/0x02)
    #[serde(default = "default_security_level")]
    pub level: u8,
    /// Shared secret as hex string; the key is the seed XOR the secret
    pub secret: String,
}

fn default_security_level() -> u8 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    #[serde(default = "default_programming_session")]
    pub programming_session: u8,
    #[serde(default = "default_default_session")]
    pub default_session: u8,
}

fn default_programming_session() -> u8 {
    session_type::PROGRAMMING
}

fn default_default_session() -> u8 {
    session_type::DEFAULT
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            programming_session: default_programming_session(),
            default_session: default_default_session(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: UpdateConfig = toml::from_str("").unwrap();
        assert_eq!(config, UpdateConfig::default());
        assert_eq!(config.timeouts.request(), Duration::from_millis(1000));
        assert_eq!(config.sessions.programming_session, 0x02);
        assert_eq!(config.block_counter_start, 1);
        assert!(config.security.is_none());
    }

    #[test]
    fn test_partial_override() {
        let config: UpdateConfig = toml::from_str(
            r#"
            block_counter_wrap = 1

            [timeouts]
            reset_settle_ms = 10

            [security]
            secret = "A5A5"
            "#,
        )
        .unwrap();
        assert_eq!(config.timeouts.reset_settle_ms, 10);
        assert_eq!(config.timeouts.request_download_ms, 20000);
        let security = config.security.unwrap();
        assert_eq!(security.level, 1);
        assert_eq!(security.secret, "A5A5");
        assert_eq!(config.block_counter_wrap, 1);
    }

    #[test]
    fn test_block_counter_wrap() {
        let mut config = UpdateConfig::default();
        assert_eq!(config.next_block_counter(1), 2);
        assert_eq!(config.next_block_counter(0xFF), 0);
        config.block_counter_wrap = 1;
        assert_eq!(config.next_block_counter(0xFF), 1);
    }
}
