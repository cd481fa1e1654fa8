//! Per-node update state and the update package

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::device_info::DeviceInfo;

/// Result of evaluating a node after the device info phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Unknown,
    /// Not reachable or did not answer
    Error,
    /// No connected interface has updates enabled
    UpdateDisabled,
    /// At least one file has to be written
    ToBeUpdated,
    /// Every application in the package is already on the node
    ApplicationMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    #[default]
    Unknown,
    Waiting,
    Updating,
    UpToDate,
    Success,
    Disabled,
}

/// Requested change of a node-side switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateChange {
    #[default]
    NoChange,
    Activate,
    Deactivate,
}

impl StateChange {
    /// Byte written to the node, `None` for no change
    pub fn as_byte(self) -> Option<u8> {
        match self {
            StateChange::NoChange => None,
            StateChange::Activate => Some(0x01),
            StateChange::Deactivate => Some(0x00),
        }
    }
}

/// One file of a node's update, processed in list order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateFile {
    Firmware { path: PathBuf },
    ParameterSet { path: PathBuf },
    Pem { path: PathBuf },
    SecurityState {
        #[serde(default)]
        security: StateChange,
        #[serde(default)]
        debugger: StateChange,
    },
}

impl UpdateFile {
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            UpdateFile::Firmware { path }
            | UpdateFile::ParameterSet { path }
            | UpdateFile::Pem { path } => Some(path),
            UpdateFile::SecurityState { .. } => None,
        }
    }
}

/// Files for one node, identified by its name in the network description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUpdate {
    pub node: String,
    #[serde(default)]
    pub files: Vec<UpdateFile>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateNodeState {
    pub connection: ConnectionStatus,
    pub update: UpdateStatus,
    /// Indices of files that are already on the node
    pub skip_files: BTreeSet<usize>,
    pub device_info: Option<DeviceInfo>,
    pub last_error: Option<String>,
}

impl UpdateNodeState {
    pub fn set_error(&mut self, message: impl Into<String>) {
        self.connection = ConnectionStatus::Error;
        self.last_error = Some(message.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Package {
        nodes: Vec<NodeUpdate>,
    }

    #[test]
    fn test_package_from_toml() {
        let package: Package = toml::from_str(
            r#"
            [[nodes]]
            node = "ECU_A"
            files = [
                { kind = "firmware", path = "a.cfw" },
                { kind = "parameter_set", path = "a.psi" },
                { kind = "security_state", security = "activate" },
            ]
            "#,
        )
        .unwrap();
        let files = &package.nodes[0].files;
        assert_eq!(files.len(), 3);
        assert_eq!(files[0].path(), Some(&PathBuf::from("a.cfw")));
        assert_eq!(
            files[2],
            UpdateFile::SecurityState {
                security: StateChange::Activate,
                debugger: StateChange::NoChange,
            }
        );
        assert_eq!(files[2].path(), None);
    }

    #[test]
    fn test_state_change_bytes() {
        assert_eq!(StateChange::NoChange.as_byte(), None);
        assert_eq!(StateChange::Activate.as_byte(), Some(1));
        assert_eq!(StateChange::Deactivate.as_byte(), Some(0));
    }
}
