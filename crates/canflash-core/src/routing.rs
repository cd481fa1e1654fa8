//! Multi-hop reachability of nodes
//!
//! A node that is not attached to the observed bus can still be reached when
//! some chain of routing-capable nodes connects the observed bus to one of its
//! buses. [`find_route`] performs a breadth-first search over buses, so the
//! returned route always has the fewest hops.

use std::collections::VecDeque;

use crate::topology::{NetworkDescription, NodeAddress};

/// One routing node on the way to a target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteHop {
    /// Node relaying the traffic
    pub node_index: usize,
    /// Bus the request arrives on
    pub in_bus: usize,
    /// Bus the request is forwarded to
    pub out_bus: usize,
}

/// Path from the observed bus to a target node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub target_node: usize,
    /// Bus on which the target is finally addressed
    pub target_bus: usize,
    pub hops: Vec<RouteHop>,
}

impl Route {
    pub fn is_direct(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.hops.len()
    }

    /// Address of the target on its final bus
    pub fn target_address(&self, description: &NetworkDescription) -> Option<NodeAddress> {
        description.node_address(self.target_node, self.target_bus)
    }
}

/// Find the shortest route from `observed_bus` to `target_node`
///
/// Returns `None` when the node is unreachable. Only connected interfaces with
/// updates enabled count for the target; only routing-enabled interfaces
/// count for intermediate nodes.
pub fn find_route(
    description: &NetworkDescription,
    observed_bus: usize,
    target_node: usize,
) -> Option<Route> {
    let target = description.nodes.get(target_node)?;
    if observed_bus >= description.buses.len() {
        return None;
    }

    let mut visited = vec![false; description.buses.len()];
    let mut queue: VecDeque<(usize, Vec<RouteHop>)> = VecDeque::new();
    visited[observed_bus] = true;
    queue.push_back((observed_bus, Vec::new()));

    while let Some((bus, hops)) = queue.pop_front() {
        let reachable_here = target
            .interfaces
            .iter()
            .any(|i| i.connected && i.update_enabled && i.bus_index == Some(bus));
        if reachable_here {
            return Some(Route {
                target_node,
                target_bus: bus,
                hops,
            });
        }

        for (node_index, node) in description.nodes.iter().enumerate() {
            if node_index == target_node {
                continue;
            }
            let enters_here = node
                .interfaces
                .iter()
                .any(|i| i.connected && i.routing_enabled && i.bus_index == Some(bus));
            if !enters_here {
                continue;
            }
            for out in node.interfaces.iter().filter(|i| i.connected && i.routing_enabled) {
                let Some(out_bus) = out.bus_index else {
                    continue;
                };
                if visited.get(out_bus).copied().unwrap_or(true) {
                    continue;
                }
                visited[out_bus] = true;
                let mut next = hops.clone();
                next.push(RouteHop {
                    node_index,
                    in_bus: bus,
                    out_bus,
                });
                queue.push_back((out_bus, next));
            }
        }
    }

    None
}
