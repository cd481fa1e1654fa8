//! canflash-core - Core types for the canflash engines
//!
//! This crate defines the data shared by the frame interpretation engine
//! (`canflash-trace`) and the update sequencing engine (`canflash-update`):
//!
//! - [`NetworkDescription`]: the read-only bus/node/datapool topology
//! - [`NetworkDescriptionRegistry`]: the set of loaded descriptions used for
//!   frame lookup, each with an active flag and an observed bus index
//! - [`CanFrame`]: a raw frame as delivered by a transport
//! - [`Route`]: multi-hop reachability of a node from the observed bus
//! - [`ProgressEvent`] / [`ProgressSink`]: the only channel through which a
//!   caller observes engine activity
//! - [`CoreError`]: the shared error taxonomy

pub mod error;
pub mod frame;
pub mod progress;
pub mod registry;
pub mod routing;
pub mod topology;

pub use error::{CoreError, CoreResult, ResultCode};
pub use frame::{CanFrame, MAX_DLC, STANDARD_ID_COUNT};
pub use progress::{
    ChannelSink, CollectingSink, ProgressEvent, ProgressSink, ProgressStep, TracingSink,
};
pub use registry::{MessageMatch, NetworkDescriptionRegistry, NodeIdentity, RegistryEntry};
pub use routing::{find_route, Route, RouteHop};
pub use topology::{
    Bus, BusType, CanMessage, CanSignal, ComInterface, ComProtocol, Datapool, DatapoolElement,
    DatapoolList, ElementRef, FlashloaderFamily, InterfaceMessages, MuxRole, NetworkDescription,
    Node, NodeAddress, ProtocolKind, SignalByteOrder, ValueType,
};
