//! Frame interpreter configuration

use serde::{Deserialize, Serialize};

use crate::filter::FilterRule;
use crate::protocols::RawProtocol;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpreterConfig {
    /// Protocol assumed for frames without a description match
    #[serde(default)]
    pub protocol: RawProtocol,
    #[serde(default)]
    pub filters: Vec<FilterRule>,
    /// Trace files show identifiers and data in hex
    #[serde(default = "default_hex_mode")]
    pub hex_mode: bool,
    /// Trace files use absolute instead of relative timestamps
    #[serde(default = "default_absolute_timestamps")]
    pub absolute_timestamps: bool,
}

fn default_hex_mode() -> bool {
    true
}

fn default_absolute_timestamps() -> bool {
    true
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            protocol: RawProtocol::default(),
            filters: Vec::new(),
            hex_mode: default_hex_mode(),
            absolute_timestamps: default_absolute_timestamps(),
        }
    }
}
