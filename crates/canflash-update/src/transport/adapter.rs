//! Transport adapter traits and types

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use canflash_core::{BusType, CanFrame, NodeAddress};
use tokio::sync::broadcast;

use super::TransportError;

/// Address information of a point-to-point channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressInfo {
    /// Transmit ID (tester -> node)
    pub tx_id: u32,
    /// Receive ID (node -> tester)
    pub rx_id: u32,
}

/// Request/response channel to a single node
///
/// Implementations carry the raw service payload; segmentation and routing
/// headers are the implementation's business.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Send a request and wait for a response
    ///
    /// # Arguments
    /// * `request` - The raw request bytes
    /// * `timeout` - Maximum time to wait for a response
    async fn send_receive(
        &self,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Send a request without waiting for a response
    async fn send(&self, request: &[u8]) -> Result<(), TransportError>;

    /// Check if the channel is connected
    async fn is_connected(&self) -> bool;

    /// Attempt to reconnect if disconnected
    async fn reconnect(&self) -> Result<(), TransportError>;

    /// Get the current address configuration
    fn address_info(&self) -> AddressInfo;
}

/// Access to the network the tester is attached to
///
/// The transport owns the physical connection to the observed bus. Unicast
/// traffic goes through per-node channels; broadcasts reach every node on
/// the observed bus only.
#[async_trait]
pub trait ConnectionTransport: Send + Sync {
    /// Kind of the observed bus
    fn bus_type(&self) -> BusType;

    /// Send a request to every node on the observed bus, no responses
    async fn broadcast(&self, request: &[u8]) -> Result<(), TransportError>;

    /// Open a request/response channel to one node
    async fn open_channel(
        &self,
        address: NodeAddress,
    ) -> Result<Arc<dyn TransportAdapter>, TransportError>;

    /// Re-establish the channel to a node after it was reset
    async fn reconnect(&self, address: NodeAddress) -> Result<(), TransportError>;

    /// Raw frames seen on the observed bus
    fn subscribe_frames(&self) -> broadcast::Receiver<CanFrame>;
}
