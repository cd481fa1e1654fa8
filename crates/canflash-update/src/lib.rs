//! canflash-update - Flashloader update sequencing
//!
//! Brings the nodes of a [`NetworkDescription`](canflash_core::NetworkDescription)
//! into their flashloaders, reads their device information, writes firmware
//! images, parameter sets, certificates and security states, and resets the
//! system afterwards. Nodes on other buses are reached through routers.
//!
//! Two flashloader families are supported:
//! - diagnostic flashloaders, driven over UDS ([`uds`])
//! - legacy flashloaders with their compact command set ([`legacy`])
//!
//! # Example
//!
//! ```ignore
//! use canflash_update::{UpdateConfig, UpdateOrchestrator};
//!
//! let orchestrator = UpdateOrchestrator::new(description, 0, transport, UpdateConfig::default())?;
//! orchestrator.set_package(package)?;
//! orchestrator.activate_flashloader().await?;
//! orchestrator.read_device_info().await?;
//! orchestrator.update(&[0, 1]).await?;
//! orchestrator.reset_system().await?;
//! ```

pub mod config;
pub mod device_info;
pub mod error;
pub mod image;
pub mod legacy;
pub mod pem;
pub mod sequence;
pub mod session;
pub mod state;
pub mod transport;
pub mod uds;

pub use config::{SecurityConfig, SessionConfig, TimeoutConfig, UpdateConfig};
pub use device_info::{DeviceInfo, DeviceInfos, DiagDeviceInfo, FlashBlockInfo, InfoBlock, LegacyDeviceInfo};
pub use error::{UpdateError, UpdateResult};
pub use image::{FirmwareImage, FirmwareImageBuilder, ImageError, MemoryArea};
pub use legacy::{LegacyError, LegacyService};
pub use pem::{PemError, PemFile};
pub use sequence::{Phase, Sequence, SequenceRunner, UpdateOrchestrator};
pub use state::{
    ConnectionStatus, NodeUpdate, StateChange, UpdateFile, UpdateNodeState, UpdateStatus,
};
pub use transport::{ConnectionTransport, MockNetwork, MockNode, TransportAdapter, TransportError};
pub use uds::{NegativeResponseCode, UdsError, UdsService};
