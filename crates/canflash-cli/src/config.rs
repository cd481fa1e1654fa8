//! Configuration file handling for canflash

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use canflash_trace::InterpreterConfig;
use canflash_update::{NodeUpdate, UpdateConfig};
use serde::{Deserialize, Serialize};

/// Configuration for the CLI tool
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Network description file (.toml, .json, .yaml)
    pub topology: Option<PathBuf>,
    /// Index of the bus the tester is attached to
    #[serde(default)]
    pub bus_index: usize,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub interpreter: InterpreterConfig,
    /// Trace files written while frames are interpreted
    #[serde(default)]
    pub log_files: Vec<PathBuf>,
    /// Files to write per node during a simulated update
    #[serde(default)]
    pub package: Vec<NodeUpdate>,
}

impl Config {
    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Topology from the command line, falling back to the config file
    pub fn topology_path(&self, arg: Option<&Path>) -> Result<PathBuf> {
        arg.map(Path::to_path_buf)
            .or_else(|| self.topology.clone())
            .context("No topology given (use --topology or set `topology` in the config file)")
    }
}
