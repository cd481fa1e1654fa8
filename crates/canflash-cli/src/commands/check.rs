//! Check command - validate a topology and show reachability

use std::path::Path;

use anyhow::{Context, Result};
use canflash_core::{find_route, FlashloaderFamily, NetworkDescription};

/// Load and validate a topology, then list every node with its route
pub fn check(path: &Path, bus_index: usize) -> Result<()> {
    let description = NetworkDescription::load(path)
        .with_context(|| format!("Invalid topology: {}", path.display()))?;
    let observed = description
        .buses
        .get(bus_index)
        .with_context(|| format!("Bus index {} out of range", bus_index))?;

    println!(
        "{}: {} buses, {} nodes, observed bus '{}' (id {})",
        path.display(),
        description.buses.len(),
        description.nodes.len(),
        observed.name,
        observed.id
    );
    for line in reachability(&description, bus_index) {
        println!("  {}", line);
    }
    Ok(())
}

/// One line per node: address, flashloader and route from the observed bus
pub fn reachability(description: &NetworkDescription, bus_index: usize) -> Vec<String> {
    description
        .nodes
        .iter()
        .enumerate()
        .map(|(index, node)| {
            let family = match node.flashloader {
                FlashloaderFamily::None => "no flashloader",
                FlashloaderFamily::Legacy => "legacy",
                FlashloaderFamily::Diagnostic => "diagnostic",
            };
            let route = match find_route(description, bus_index, index) {
                None => "unreachable".to_string(),
                Some(route) if route.is_direct() => match route.target_address(description) {
                    Some(address) => format!("direct, {}", address),
                    None => "direct".to_string(),
                },
                Some(route) => {
                    let via: Vec<&str> = route
                        .hops
                        .iter()
                        .map(|hop| description.nodes[hop.node_index].name.as_str())
                        .collect();
                    format!("via {}", via.join(" -> "))
                }
            };
            format!("{:<16} {:<14} {}", node.name, family, route)
        })
        .collect()
}
