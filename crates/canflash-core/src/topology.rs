//! Network topology description
//!
//! A [`NetworkDescription`] is the static snapshot of buses, nodes, their
//! communication interfaces, COM protocol message tables and datapools. It is
//! loaded once from a file and never mutated afterwards; the registry entry
//! holding it owns the mutable "active" flag and observed bus index.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};

// =============================================================================
// Buses and nodes
// =============================================================================

/// Physical bus kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusType {
    Can,
    Ethernet,
}

/// A bus of the system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bus {
    /// Bus identifier used in diagnostic addressing
    pub id: u8,
    /// Human-readable name
    pub name: String,
    #[serde(rename = "type", default = "default_bus_type")]
    pub bus_type: BusType,
}

fn default_bus_type() -> BusType {
    BusType::Can
}

/// Flashloader protocol family a node speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashloaderFamily {
    /// Node can not be updated
    #[default]
    None,
    /// Legacy CAN flashloader (info blocks, broadcast reset wake-up)
    Legacy,
    /// UDS-based diagnostic flashloader
    Diagnostic,
}

/// A node's attachment to one bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComInterface {
    /// Interface number on the node (CAN1 = 0, ...)
    #[serde(default)]
    pub interface_number: u8,
    /// Diagnostic node id on the attached bus
    pub node_id: u8,
    /// Index into [`NetworkDescription::buses`]; `None` when unconnected
    #[serde(default)]
    pub bus_index: Option<usize>,
    #[serde(default = "default_true")]
    pub connected: bool,
    /// Node relays diagnostic traffic between its routing-enabled interfaces
    #[serde(default)]
    pub routing_enabled: bool,
    /// Node accepts updates through this interface
    #[serde(default = "default_true")]
    pub update_enabled: bool,
}

fn default_true() -> bool {
    true
}

/// A node of the system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    /// Device type the node reports as its device name
    #[serde(default)]
    pub device_type: String,
    #[serde(default)]
    pub flashloader: FlashloaderFamily,
    #[serde(default)]
    pub interfaces: Vec<ComInterface>,
    #[serde(default)]
    pub datapools: Vec<Datapool>,
    #[serde(default)]
    pub protocols: Vec<ComProtocol>,
}

impl Node {
    /// Connected interface attached to the given bus
    pub fn interface_on_bus(&self, bus_index: usize) -> Option<(usize, &ComInterface)> {
        self.interfaces
            .iter()
            .enumerate()
            .find(|(_, i)| i.connected && i.bus_index == Some(bus_index))
    }
}

/// Diagnostic address of a node: bus id plus node id on that bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct NodeAddress {
    pub bus_id: u8,
    pub node_id: u8,
}

impl std::fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bus {} node {}", self.bus_id, self.node_id)
    }
}

// =============================================================================
// Datapools
// =============================================================================

/// Raw storage type of a datapool element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    #[default]
    U8,
    U16,
    U32,
    U64,
    S8,
    S16,
    S32,
    S64,
    F32,
    F64,
}

impl ValueType {
    pub fn is_signed(self) -> bool {
        matches!(
            self,
            ValueType::S8 | ValueType::S16 | ValueType::S32 | ValueType::S64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, ValueType::F32 | ValueType::F64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatapoolElement {
    pub name: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub min: f64,
    #[serde(default)]
    pub max: f64,
    #[serde(default, rename = "type")]
    pub value_type: ValueType,
    /// Raw value to text mapping
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub value_table: BTreeMap<i64, String>,
}

fn default_factor() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatapoolList {
    pub name: String,
    #[serde(default)]
    pub elements: Vec<DatapoolElement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datapool {
    pub name: String,
    #[serde(default)]
    pub lists: Vec<DatapoolList>,
}

// =============================================================================
// COM protocols and messages
// =============================================================================

/// COM protocol family of a message table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    /// Plain layer 2 messages
    #[default]
    Layer2,
    /// Safety messages carrying a sequence counter and a checksum
    Eces,
    /// Safety messages followed by a bit-inverted duplicate at `id + 1`
    Ecos,
}

/// Bit numbering convention of a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalByteOrder {
    /// Little endian; start bit is the LSB
    #[default]
    Intel,
    /// Big endian; start bit is the MSB (DBC convention)
    Motorola,
}

/// Multiplexing role of a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MuxRole {
    /// Always present
    #[default]
    Plain,
    /// Selects the active multiplexed group
    Multiplexer,
    /// Present only when the multiplexer carries this value
    Multiplexed(u16),
}

/// Reference from a signal to its datapool element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ElementRef {
    pub list_index: usize,
    pub element_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanSignal {
    pub start_bit: u16,
    pub bit_length: u16,
    #[serde(default)]
    pub byte_order: SignalByteOrder,
    #[serde(default)]
    pub mux: MuxRole,
    pub element: ElementRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanMessage {
    pub name: String,
    pub can_id: u32,
    #[serde(default)]
    pub extended: bool,
    #[serde(default = "default_dlc")]
    pub dlc: u8,
    #[serde(default)]
    pub signals: Vec<CanSignal>,
}

fn default_dlc() -> u8 {
    8
}

impl CanMessage {
    pub fn matches(&self, id: u32, extended: bool) -> bool {
        self.can_id == id && self.extended == extended
    }
}

/// Tx/Rx message tables of one interface
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InterfaceMessages {
    #[serde(default)]
    pub tx: Vec<CanMessage>,
    #[serde(default)]
    pub rx: Vec<CanMessage>,
}

/// A COM protocol of a node; `interfaces[i]` belongs to `Node::interfaces[i]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComProtocol {
    #[serde(default)]
    pub kind: ProtocolKind,
    /// Datapool holding the signal elements
    pub datapool_index: usize,
    #[serde(default)]
    pub interfaces: Vec<InterfaceMessages>,
}

// =============================================================================
// Description
// =============================================================================

/// Loaded system topology
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NetworkDescription {
    #[serde(default)]
    pub buses: Vec<Bus>,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl NetworkDescription {
    /// Load a description from a `.toml`, `.json`, `.yaml` or `.yml` file
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Io(format!("{}: {}", path.display(), e)))?;

        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase());

        let description: NetworkDescription = match extension.as_deref() {
            Some("toml") => toml::from_str(&content)
                .map_err(|e| CoreError::Config(format!("{}: {}", path.display(), e)))?,
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| CoreError::Config(format!("{}: {}", path.display(), e)))?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .map_err(|e| CoreError::Config(format!("{}: {}", path.display(), e)))?,
            other => {
                return Err(CoreError::Config(format!(
                    "Unsupported topology file format: {:?}",
                    other
                )))
            }
        };

        description.validate()?;
        info!(
            path = %path.display(),
            buses = description.buses.len(),
            nodes = description.nodes.len(),
            "Network description loaded"
        );
        Ok(description)
    }

    /// Check bus and element references
    pub fn validate(&self) -> CoreResult<()> {
        for node in &self.nodes {
            for iface in &node.interfaces {
                if let Some(bus_index) = iface.bus_index {
                    if bus_index >= self.buses.len() {
                        return Err(CoreError::Config(format!(
                            "Node '{}' interface {} references bus index {} (only {} buses)",
                            node.name,
                            iface.interface_number,
                            bus_index,
                            self.buses.len()
                        )));
                    }
                }
            }

            for protocol in &node.protocols {
                let datapool = node.datapools.get(protocol.datapool_index).ok_or_else(|| {
                    CoreError::Config(format!(
                        "Node '{}' protocol {:?} references datapool {} out of range",
                        node.name, protocol.kind, protocol.datapool_index
                    ))
                })?;

                let messages = protocol
                    .interfaces
                    .iter()
                    .flat_map(|m| m.tx.iter().chain(m.rx.iter()));
                for message in messages {
                    for signal in &message.signals {
                        let in_bounds = datapool
                            .lists
                            .get(signal.element.list_index)
                            .map(|l| signal.element.element_index < l.elements.len())
                            .unwrap_or(false);
                        if !in_bounds {
                            return Err(CoreError::Config(format!(
                                "Message '{}' of node '{}' references element {}/{} out of range",
                                message.name,
                                node.name,
                                signal.element.list_index,
                                signal.element.element_index
                            )));
                        }
                    }
                }
            }
        }
        debug!("Network description validated");
        Ok(())
    }

    pub fn bus_index_by_id(&self, bus_id: u8) -> Option<usize> {
        self.buses.iter().position(|b| b.id == bus_id)
    }

    pub fn node_index_by_name(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == name)
    }

    /// Diagnostic address of a node on the given bus
    pub fn node_address(&self, node_index: usize, bus_index: usize) -> Option<NodeAddress> {
        let node = self.nodes.get(node_index)?;
        let bus = self.buses.get(bus_index)?;
        let (_, iface) = node.interface_on_bus(bus_index)?;
        Some(NodeAddress {
            bus_id: bus.id,
            node_id: iface.node_id,
        })
    }

    /// Resolve the datapool element a signal of `node`'s protocol refers to
    pub fn element(
        &self,
        node_index: usize,
        datapool_index: usize,
        element: ElementRef,
    ) -> Option<&DatapoolElement> {
        self.nodes
            .get(node_index)?
            .datapools
            .get(datapool_index)?
            .lists
            .get(element.list_index)?
            .elements
            .get(element.element_index)
    }
}
