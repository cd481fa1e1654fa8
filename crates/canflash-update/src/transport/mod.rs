//! Transport layer for flashloader communication
//!
//! This module provides the transport abstractions used by the update
//! sequence:
//! - [`ConnectionTransport`]: the tester's attachment to the observed bus
//! - [`TransportAdapter`]: a request/response channel to one node
//! - [`mock`]: an in-memory network of simulated nodes for tests and demos
//!
//! # Example
//!
//! ```ignore
//! use canflash_update::transport::{ConnectionTransport, MockNetwork, MockNode};
//!
//! let network = MockNetwork::new(0);
//! network.add_node(MockNode::diagnostic("ECU_A", "DEV-A").on(0, 1));
//! let channel = network.open_channel(NodeAddress { bus_id: 0, node_id: 1 }).await?;
//! let response = channel.send_receive(&[0x22, 0xF1, 0x97], Duration::from_secs(1)).await?;
//! ```

mod adapter;
pub mod error;
pub mod mock;

pub use adapter::{AddressInfo, ConnectionTransport, TransportAdapter};
pub use error::TransportError;
pub use mock::{MockNetwork, MockNode};
