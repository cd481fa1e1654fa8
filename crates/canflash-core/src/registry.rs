//! Registry of loaded network descriptions
//!
//! The frame interpreter can observe several systems at once. Each loaded
//! description is registered under its file path together with the index of
//! the bus being observed and an active flag. Lookups iterate the entries from
//! the most recently registered to the oldest; the first match wins.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};
use crate::topology::{
    CanMessage, CanSignal, DatapoolElement, NetworkDescription, ProtocolKind,
};

/// One loaded description
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    /// Key; the path the description was loaded from
    pub path: String,
    pub description: Arc<NetworkDescription>,
    /// Index of the bus whose traffic is being observed
    pub bus_index: usize,
    pub active: bool,
}

/// A message definition matching a frame
#[derive(Debug, Clone, Copy)]
pub struct MessageMatch<'a> {
    pub description: &'a NetworkDescription,
    pub node_index: usize,
    pub protocol: ProtocolKind,
    pub datapool_index: usize,
    pub message: &'a CanMessage,
}

impl<'a> MessageMatch<'a> {
    /// Datapool element carrying a signal's name, unit and scaling
    pub fn element(&self, signal: &CanSignal) -> Option<&'a DatapoolElement> {
        self.description
            .element(self.node_index, self.datapool_index, signal.element)
    }
}

/// Names resolved for an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub node_name: String,
    pub bus_name: String,
}

#[derive(Debug, Default)]
pub struct NetworkDescriptionRegistry {
    entries: Vec<RegistryEntry>,
}

impl NetworkDescriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a description; an entry with the same path is replaced and
    /// moves to the highest priority
    pub fn add(
        &mut self,
        path: impl Into<String>,
        description: Arc<NetworkDescription>,
        bus_index: usize,
    ) -> CoreResult<()> {
        let path = path.into();
        check_bus_index(&description, bus_index)?;

        self.entries.retain(|e| e.path != path);
        info!(path = %path, bus_index, "Network description registered");
        self.entries.push(RegistryEntry {
            path,
            description,
            bus_index,
            active: true,
        });
        Ok(())
    }

    /// Remove an entry; returns whether it existed
    pub fn remove(&mut self, path: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.path != path);
        let removed = self.entries.len() != before;
        if removed {
            info!(path = %path, "Network description removed");
        }
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn set_active(&mut self, path: &str, active: bool) -> CoreResult<()> {
        let entry = self.entry_mut(path)?;
        entry.active = active;
        debug!(path = %path, active, "Network description activation changed");
        Ok(())
    }

    pub fn set_bus_index(&mut self, path: &str, bus_index: usize) -> CoreResult<()> {
        let entry = self.entry_mut(path)?;
        check_bus_index(&entry.description, bus_index)?;
        entry.bus_index = bus_index;
        debug!(path = %path, bus_index, "Observed bus changed");
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<&RegistryEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in lookup order, most recently registered first
    pub fn iter_by_priority(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.iter().rev()
    }

    /// Find the message definition for a frame identifier
    ///
    /// Only active entries are searched, and only the Tx tables of interfaces
    /// connected to the entry's observed bus. ECoS protocol tables are searched
    /// in both directions.
    pub fn find_message(&self, id: u32, extended: bool) -> Option<MessageMatch<'_>> {
        for entry in self.iter_by_priority().filter(|e| e.active) {
            let description = entry.description.as_ref();
            for (node_index, node) in description.nodes.iter().enumerate() {
                let Some((iface_index, _)) = node.interface_on_bus(entry.bus_index) else {
                    continue;
                };
                for protocol in &node.protocols {
                    let Some(tables) = protocol.interfaces.get(iface_index) else {
                        continue;
                    };
                    let found = tables.tx.iter().find(|m| m.matches(id, extended)).or_else(|| {
                        if protocol.kind == ProtocolKind::Ecos {
                            tables.rx.iter().find(|m| m.matches(id, extended))
                        } else {
                            None
                        }
                    });
                    if let Some(message) = found {
                        return Some(MessageMatch {
                            description,
                            node_index,
                            protocol: protocol.kind,
                            datapool_index: protocol.datapool_index,
                            message,
                        });
                    }
                }
            }
        }
        None
    }

    /// Resolve node and bus names for a diagnostic address
    pub fn resolve_node(&self, bus_id: u8, node_id: u8) -> Option<NodeIdentity> {
        for entry in self.iter_by_priority() {
            let description = entry.description.as_ref();
            let Some(bus_index) = description.bus_index_by_id(bus_id) else {
                continue;
            };
            let node = description.nodes.iter().find(|n| {
                n.interface_on_bus(bus_index)
                    .map(|(_, i)| i.node_id == node_id)
                    .unwrap_or(false)
            });
            if let Some(node) = node {
                return Some(NodeIdentity {
                    node_name: node.name.clone(),
                    bus_name: description.buses[bus_index].name.clone(),
                });
            }
        }
        None
    }

    /// Datapool element lookup by explicit indices
    pub fn element(
        &self,
        path: &str,
        node_index: usize,
        datapool_index: usize,
        list_index: usize,
        element_index: usize,
    ) -> Option<&DatapoolElement> {
        self.get(path)?
            .description
            .nodes
            .get(node_index)?
            .datapools
            .get(datapool_index)?
            .lists
            .get(list_index)?
            .elements
            .get(element_index)
    }

    fn entry_mut(&mut self, path: &str) -> CoreResult<&mut RegistryEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.path == path)
            .ok_or_else(|| CoreError::Config(format!("No network description loaded from '{}'", path)))
    }
}

fn check_bus_index(description: &NetworkDescription, bus_index: usize) -> CoreResult<()> {
    if bus_index >= description.buses.len() {
        return Err(CoreError::Config(format!(
            "Bus index {} out of range ({} buses)",
            bus_index,
            description.buses.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::tests::sample;

    #[test]
    fn test_find_message_in_active_entry() {
        let mut registry = NetworkDescriptionRegistry::new();
        registry.add("a.json", Arc::new(sample()), 0).unwrap();

        let m = registry.find_message(0x100, false).unwrap();
        assert_eq!(m.message.name, "Status");
        assert_eq!(m.node_index, 0);
        assert!(registry.find_message(0x100, true).is_none());
        assert!(registry.find_message(0x101, false).is_none());
    }

    #[test]
    fn test_inactive_entry_is_skipped() {
        let mut registry = NetworkDescriptionRegistry::new();
        registry.add("a.json", Arc::new(sample()), 0).unwrap();
        registry.set_active("a.json", false).unwrap();
        assert!(registry.find_message(0x100, false).is_none());
    }

    #[test]
    fn test_most_recent_entry_wins() {
        let mut other = sample();
        other.nodes[0].protocols[0].interfaces[0].tx[0].name = "Other".to_string();

        let mut registry = NetworkDescriptionRegistry::new();
        registry.add("a.json", Arc::new(sample()), 0).unwrap();
        registry.add("b.json", Arc::new(other), 0).unwrap();

        assert_eq!(registry.find_message(0x100, false).unwrap().message.name, "Other");

        // Re-adding moves an entry to the front
        registry.add("a.json", Arc::new(sample()), 0).unwrap();
        assert_eq!(registry.find_message(0x100, false).unwrap().message.name, "Status");
    }

    #[test]
    fn test_rx_only_matched_for_ecos() {
        let mut desc = sample();
        let tables = &mut desc.nodes[0].protocols[0].interfaces[0];
        let mut rx = tables.tx.remove(0);
        rx.can_id = 0x200;
        tables.rx.push(rx);

        let mut registry = NetworkDescriptionRegistry::new();
        registry.add("a.json", Arc::new(desc.clone()), 0).unwrap();
        assert!(registry.find_message(0x200, false).is_none());

        desc.nodes[0].protocols[0].kind = ProtocolKind::Ecos;
        registry.add("a.json", Arc::new(desc), 0).unwrap();
        let m = registry.find_message(0x200, false).unwrap();
        assert_eq!(m.protocol, ProtocolKind::Ecos);
    }

    #[test]
    fn test_bus_index_checked() {
        let mut registry = NetworkDescriptionRegistry::new();
        assert!(registry.add("a.json", Arc::new(sample()), 1).is_err());
        registry.add("a.json", Arc::new(sample()), 0).unwrap();
        assert!(registry.set_bus_index("a.json", 4).is_err());
        assert!(registry.set_bus_index("missing.json", 0).is_err());
    }

    #[test]
    fn test_resolve_node_and_remove() {
        let mut registry = NetworkDescriptionRegistry::new();
        registry.add("a.json", Arc::new(sample()), 0).unwrap();

        let identity = registry.resolve_node(0, 1).unwrap();
        assert_eq!(identity.node_name, "ECU1");
        assert_eq!(identity.bus_name, "CAN1");
        assert!(registry.resolve_node(0, 9).is_none());

        assert_eq!(
            registry.element("a.json", 0, 0, 0, 0).map(|e| e.name.as_str()),
            Some("Speed")
        );

        assert!(registry.remove("a.json"));
        assert!(!registry.remove("a.json"));
        assert!(registry.is_empty());
    }
}
