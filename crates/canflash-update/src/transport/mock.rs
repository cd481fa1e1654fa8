//! Simulated network for testing and demos
//!
//! A [`MockNetwork`] is a set of [`MockNode`]s spread over buses. The tester
//! sits on the local bus; nodes on other buses are only reachable after some
//! router on an already reachable bus has enabled routing towards them, the
//! same way real routing nodes forward diagnostic traffic.
//!
//! Every exchange is also published as raw frames on the network's frame
//! stream so a frame interpreter can be attached to it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use canflash_core::{BusType, CanFrame, FlashloaderFamily, NodeAddress};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

use super::{AddressInfo, ConnectionTransport, TransportAdapter, TransportError};
use crate::device_info::{encode_flash_blocks, encode_info_blocks, FlashBlockInfo, InfoBlock};
use crate::legacy::{self, command};
use crate::session::compute_key;
use crate::uds::{flashloader_did, flashloader_routine, service_id, session_type};

const FRAME_CHANNEL_CAPACITY: usize = 1024;
const REQUEST_BASE_ID: u32 = 0x600;
const RESPONSE_BASE_ID: u32 = 0x580;
const MOCK_SEED: [u8; 4] = [0x11, 0x22, 0x33, 0x44];

// Negative response codes sent by the simulation
const NRC_SERVICE_NOT_SUPPORTED: u8 = 0x11;
const NRC_INCORRECT_LENGTH: u8 = 0x13;
const NRC_CONDITIONS_NOT_CORRECT: u8 = 0x22;
const NRC_REQUEST_SEQUENCE_ERROR: u8 = 0x24;
const NRC_REQUEST_OUT_OF_RANGE: u8 = 0x31;
const NRC_SECURITY_ACCESS_DENIED: u8 = 0x33;
const NRC_INVALID_KEY: u8 = 0x35;
const NRC_WRONG_BLOCK_SEQUENCE_COUNTER: u8 = 0x73;

// Legacy rejection codes
const LEGACY_NOT_IN_FLASHLOADER: u8 = 0x01;
const LEGACY_OUT_OF_RANGE: u8 = 0x02;
const LEGACY_UNKNOWN_COMMAND: u8 = 0x03;

// =============================================================================
// Node
// =============================================================================

#[derive(Debug, Default)]
struct Download {
    address: u32,
    size: u32,
    next_counter: u8,
    received: Vec<u8>,
}

#[derive(Debug, Default)]
struct NodeState {
    in_flashloader: bool,
    programming_requested: bool,
    awaiting_wake_up: bool,
    session: u8,
    seed_sent: bool,
    unlocked: bool,
    routing_to: BTreeSet<u8>,
    download: Option<Download>,
    /// Completed download waiting for the check routine
    pending_check: Option<(u32, u32)>,
    /// Erased range of a legacy programming cycle
    erased: Option<(u32, u32)>,
    memory: BTreeMap<u32, Vec<u8>>,
    flash_blocks: Vec<FlashBlockInfo>,
    info_blocks: Vec<InfoBlock>,
    parameter_set: Option<Vec<u8>>,
    certificate: Option<Vec<u8>>,
    security_state: Option<u8>,
    debugger_state: Option<u8>,
    reset_count: u32,
    requests: Vec<Vec<u8>>,
}

/// Simulated node with a diagnostic or legacy flashloader
#[derive(Debug)]
pub struct MockNode {
    name: String,
    family: FlashloaderFamily,
    device_name: String,
    flashloader_version: String,
    addresses: Vec<NodeAddress>,
    router: bool,
    max_block_length: u32,
    secret: Option<Vec<u8>>,
    /// Writable ranges; empty means everything is writable
    memory_ranges: Vec<(u32, u32)>,
    fail_check: bool,
    responsive: AtomicBool,
    state: Mutex<NodeState>,
}

impl MockNode {
    fn new(name: &str, family: FlashloaderFamily, device_name: &str) -> Self {
        Self {
            name: name.to_string(),
            family,
            device_name: device_name.to_string(),
            flashloader_version: "V1.00r0".to_string(),
            addresses: Vec::new(),
            router: false,
            max_block_length: 256,
            secret: None,
            memory_ranges: Vec::new(),
            fail_check: false,
            responsive: AtomicBool::new(true),
            state: Mutex::new(NodeState {
                session: session_type::DEFAULT,
                ..Default::default()
            }),
        }
    }

    /// Node with a diagnostic (UDS) flashloader, running its application
    pub fn diagnostic(name: &str, device_name: &str) -> Self {
        Self::new(name, FlashloaderFamily::Diagnostic, device_name)
    }

    /// Node with a legacy flashloader, running its application
    pub fn legacy(name: &str, device_name: &str) -> Self {
        Self::new(name, FlashloaderFamily::Legacy, device_name)
    }

    /// Attach the node to a bus
    pub fn on(mut self, bus_id: u8, node_id: u8) -> Self {
        self.addresses.push(NodeAddress { bus_id, node_id });
        self
    }

    /// Allow the node to forward traffic between its buses
    pub fn router(mut self) -> Self {
        self.router = true;
        self
    }

    pub fn with_max_block_length(mut self, max_block_length: u32) -> Self {
        self.max_block_length = max_block_length;
        self
    }

    /// Require seed/key security access with this secret before programming
    pub fn with_secret(mut self, secret: &[u8]) -> Self {
        self.secret = Some(secret.to_vec());
        self
    }

    /// Restrict programming to `[start, start + size)`; may be repeated
    pub fn with_memory(mut self, start: u32, size: u32) -> Self {
        self.memory_ranges.push((start, size));
        self
    }

    /// Application already present on the node
    pub fn with_application(self, name: &str, version: &str) -> Self {
        {
            let mut state = self.state.lock();
            let address = 0x0800_0000 + 0x1_0000 * state.flash_blocks.len() as u32;
            state.flash_blocks.push(FlashBlockInfo {
                address,
                size: 0x1_0000,
                signature_valid: true,
                application_name: name.to_string(),
                application_version: version.to_string(),
            });
            state.info_blocks.push(InfoBlock {
                address,
                project_name: name.to_string(),
                project_version: version.to_string(),
            });
        }
        self
    }

    /// Report a failing flash check after every transfer
    pub fn with_failing_check(mut self) -> Self {
        self.fail_check = true;
        self
    }

    /// Start the node already in its flashloader
    pub fn in_flashloader(self) -> Self {
        self.state.lock().in_flashloader = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addresses(&self) -> &[NodeAddress] {
        &self.addresses
    }

    /// A silent node never answers
    pub fn set_responsive(&self, responsive: bool) {
        self.responsive.store(responsive, Ordering::SeqCst);
    }

    pub fn is_in_flashloader(&self) -> bool {
        self.state.lock().in_flashloader
    }

    pub fn session(&self) -> u8 {
        self.state.lock().session
    }

    pub fn is_unlocked(&self) -> bool {
        self.state.lock().unlocked
    }

    pub fn routes_to(&self, bus_id: u8) -> bool {
        self.state.lock().routing_to.contains(&bus_id)
    }

    /// Data programmed at `address`
    pub fn memory(&self, address: u32) -> Option<Vec<u8>> {
        self.state.lock().memory.get(&address).cloned()
    }

    pub fn parameter_set(&self) -> Option<Vec<u8>> {
        self.state.lock().parameter_set.clone()
    }

    pub fn certificate(&self) -> Option<Vec<u8>> {
        self.state.lock().certificate.clone()
    }

    pub fn security_state(&self) -> Option<u8> {
        self.state.lock().security_state
    }

    pub fn debugger_state(&self) -> Option<u8> {
        self.state.lock().debugger_state
    }

    pub fn reset_count(&self) -> u32 {
        self.state.lock().reset_count
    }

    /// Unicast requests received, oldest first
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.state.lock().requests.clone()
    }

    fn has_bus(&self, bus_id: u8) -> bool {
        self.addresses.iter().any(|a| a.bus_id == bus_id)
    }

    fn in_memory(&self, address: u32, size: u32) -> bool {
        if self.memory_ranges.is_empty() {
            return true;
        }
        let end = address as u64 + size as u64;
        self.memory_ranges
            .iter()
            .any(|(start, len)| address >= *start && end <= *start as u64 + *len as u64)
    }

    fn reset(&self, state: &mut NodeState) {
        state.in_flashloader = match self.family {
            FlashloaderFamily::Legacy => false,
            _ => state.programming_requested,
        };
        state.programming_requested = false;
        state.session = session_type::DEFAULT;
        state.seed_sent = false;
        state.unlocked = false;
        state.routing_to.clear();
        state.download = None;
        state.pending_check = None;
        state.erased = None;
        state.reset_count += 1;
    }

    /// Broadcast requests get no response
    fn handle_broadcast(&self, request: &[u8]) {
        let mut state = self.state.lock();
        match self.family {
            FlashloaderFamily::Legacy => {
                if request == [command::NET_RESET] {
                    self.reset(&mut state);
                    state.awaiting_wake_up = true;
                } else if request == legacy::WAKE_UP && state.awaiting_wake_up {
                    state.awaiting_wake_up = false;
                    state.in_flashloader = true;
                }
            }
            _ => {
                let _ = self.handle_uds(&mut state, request);
            }
        }
    }

    fn handle_request(&self, request: &[u8]) -> Option<Vec<u8>> {
        if !self.responsive.load(Ordering::SeqCst) {
            return None;
        }
        let mut state = self.state.lock();
        state.requests.push(request.to_vec());
        match self.family {
            FlashloaderFamily::Legacy => Some(self.handle_legacy(&mut state, request)),
            _ => Some(self.handle_uds(&mut state, request)),
        }
    }

    // =========================================================================
    // Diagnostic flashloader
    // =========================================================================

    fn handle_uds(&self, state: &mut NodeState, request: &[u8]) -> Vec<u8> {
        let Some(&sid) = request.first() else {
            return negative(0, NRC_INCORRECT_LENGTH);
        };
        let args = &request[1..];

        match sid {
            service_id::DIAGNOSTIC_SESSION_CONTROL => {
                let Some(&session) = args.first() else {
                    return negative(sid, NRC_INCORRECT_LENGTH);
                };
                if session == session_type::PROGRAMMING && !state.in_flashloader {
                    return negative(sid, NRC_CONDITIONS_NOT_CORRECT);
                }
                state.session = session;
                state.seed_sent = false;
                state.unlocked = false;
                vec![positive(sid), session, 0x00, 0x19, 0x01, 0xF4]
            }
            service_id::ECU_RESET => {
                let reset_type = args.first().copied().unwrap_or(0x01);
                self.reset(state);
                vec![positive(sid), reset_type]
            }
            service_id::TESTER_PRESENT => vec![positive(sid), 0x00],
            service_id::READ_DATA_BY_ID => self.read_did(state, sid, args),
            service_id::WRITE_DATA_BY_ID => self.write_did(state, sid, args),
            _ if !state.in_flashloader => negative(sid, NRC_CONDITIONS_NOT_CORRECT),
            service_id::SECURITY_ACCESS => self.security_access(state, sid, args),
            service_id::ROUTINE_CONTROL => self.routine_control(state, sid, args),
            service_id::REQUEST_DOWNLOAD => self.request_download(state, sid, args),
            service_id::TRANSFER_DATA => self.transfer_data(state, sid, args),
            service_id::REQUEST_TRANSFER_EXIT => {
                let Some(download) = state.download.take() else {
                    return negative(sid, NRC_REQUEST_SEQUENCE_ERROR);
                };
                if download.received.len() as u32 != download.size {
                    state.download = Some(download);
                    return negative(sid, NRC_REQUEST_SEQUENCE_ERROR);
                }
                state.pending_check = Some((download.address, download.size));
                state.memory.insert(download.address, download.received);
                vec![positive(sid)]
            }
            _ => negative(sid, NRC_SERVICE_NOT_SUPPORTED),
        }
    }

    fn programming_allowed(&self, state: &NodeState) -> Result<(), u8> {
        if !state.in_flashloader || state.session != session_type::PROGRAMMING {
            return Err(NRC_CONDITIONS_NOT_CORRECT);
        }
        if self.secret.is_some() && !state.unlocked {
            return Err(NRC_SECURITY_ACCESS_DENIED);
        }
        Ok(())
    }

    fn read_did(&self, state: &NodeState, sid: u8, args: &[u8]) -> Vec<u8> {
        if args.len() != 2 {
            return negative(sid, NRC_INCORRECT_LENGTH);
        }
        let did = u16::from_be_bytes([args[0], args[1]]);
        let data = match did {
            flashloader_did::DEVICE_NAME => self.device_name.as_bytes().to_vec(),
            _ if !state.in_flashloader => return negative(sid, NRC_CONDITIONS_NOT_CORRECT),
            flashloader_did::FLASHLOADER_VERSION => self.flashloader_version.as_bytes().to_vec(),
            flashloader_did::MAX_BLOCK_LENGTH => self.max_block_length.to_be_bytes().to_vec(),
            flashloader_did::FLASH_BLOCKS => encode_flash_blocks(&state.flash_blocks),
            _ => return negative(sid, NRC_REQUEST_OUT_OF_RANGE),
        };
        let mut response = vec![positive(sid), args[0], args[1]];
        response.extend_from_slice(&data);
        response
    }

    fn write_did(&self, state: &mut NodeState, sid: u8, args: &[u8]) -> Vec<u8> {
        if args.len() < 3 {
            return negative(sid, NRC_INCORRECT_LENGTH);
        }
        let did = u16::from_be_bytes([args[0], args[1]]);
        let data = &args[2..];

        if did == flashloader_did::REQUEST_PROGRAMMING {
            state.programming_requested = data[0] == 0x01;
            return vec![positive(sid), args[0], args[1]];
        }
        if let Err(nrc) = self.programming_allowed(state) {
            return negative(sid, nrc);
        }
        if data.len() as u32 > self.max_block_length {
            return negative(sid, NRC_INCORRECT_LENGTH);
        }
        match did {
            flashloader_did::PARAMETER_SET => state.parameter_set = Some(data.to_vec()),
            flashloader_did::CERTIFICATE_KEY => state.certificate = Some(data.to_vec()),
            flashloader_did::SECURITY_STATE => state.security_state = Some(data[0]),
            flashloader_did::DEBUGGER_STATE => state.debugger_state = Some(data[0]),
            _ => return negative(sid, NRC_REQUEST_OUT_OF_RANGE),
        }
        vec![positive(sid), args[0], args[1]]
    }

    fn security_access(&self, state: &mut NodeState, sid: u8, args: &[u8]) -> Vec<u8> {
        let Some(&sub_function) = args.first() else {
            return negative(sid, NRC_INCORRECT_LENGTH);
        };
        if sub_function % 2 == 1 {
            let mut response = vec![positive(sid), sub_function];
            if self.secret.is_none() || state.unlocked {
                response.extend_from_slice(&[0; MOCK_SEED.len()]);
            } else {
                state.seed_sent = true;
                response.extend_from_slice(&MOCK_SEED);
            }
            return response;
        }

        if !state.seed_sent {
            return negative(sid, NRC_REQUEST_SEQUENCE_ERROR);
        }
        state.seed_sent = false;
        let expected = compute_key(&MOCK_SEED, self.secret.as_deref().unwrap_or_default());
        if args[1..] != expected[..] {
            return negative(sid, NRC_INVALID_KEY);
        }
        state.unlocked = true;
        vec![positive(sid), sub_function]
    }

    fn routine_control(&self, state: &mut NodeState, sid: u8, args: &[u8]) -> Vec<u8> {
        if args.len() < 3 || args[0] != 0x01 {
            return negative(sid, NRC_INCORRECT_LENGTH);
        }
        let routine = u16::from_be_bytes([args[1], args[2]]);
        let params = &args[3..];
        let status = match routine {
            flashloader_routine::ROUTING_ENABLE => {
                let Some(&out_bus) = params.first() else {
                    return negative(sid, NRC_INCORRECT_LENGTH);
                };
                if !self.router || !self.has_bus(out_bus) {
                    return negative(sid, NRC_REQUEST_OUT_OF_RANGE);
                }
                state.routing_to.insert(out_bus);
                0x00
            }
            flashloader_routine::CHECK_FLASH_MEMORY => {
                let Some((address, size)) = state.pending_check.take() else {
                    return negative(sid, NRC_REQUEST_SEQUENCE_ERROR);
                };
                if self.fail_check {
                    0x01
                } else {
                    state.flash_blocks.retain(|b| b.address != address);
                    state.flash_blocks.push(FlashBlockInfo {
                        address,
                        size,
                        signature_valid: true,
                        application_name: String::new(),
                        application_version: String::new(),
                    });
                    0x00
                }
            }
            _ => return negative(sid, NRC_REQUEST_OUT_OF_RANGE),
        };
        vec![positive(sid), args[0], args[1], args[2], status]
    }

    fn request_download(&self, state: &mut NodeState, sid: u8, args: &[u8]) -> Vec<u8> {
        if let Err(nrc) = self.programming_allowed(state) {
            return negative(sid, nrc);
        }
        // dataFormat, addressAndLengthFormat 0x44, address u32, size u32
        if args.len() != 10 || args[1] != 0x44 {
            return negative(sid, NRC_INCORRECT_LENGTH);
        }
        let address = u32::from_be_bytes([args[2], args[3], args[4], args[5]]);
        let size = u32::from_be_bytes([args[6], args[7], args[8], args[9]]);
        if !self.in_memory(address, size) {
            return negative(sid, NRC_REQUEST_OUT_OF_RANGE);
        }
        state.download = Some(Download {
            address,
            size,
            next_counter: 0x01,
            received: Vec::with_capacity(size as usize),
        });
        // maxNumberOfBlockLength counts the service ID and the counter
        let max = (self.max_block_length + 2).min(u16::MAX as u32) as u16;
        let [hi, lo] = max.to_be_bytes();
        vec![positive(sid), 0x20, hi, lo]
    }

    fn transfer_data(&self, state: &mut NodeState, sid: u8, args: &[u8]) -> Vec<u8> {
        let max_block_length = self.max_block_length as usize;
        let Some(download) = state.download.as_mut() else {
            return negative(sid, NRC_REQUEST_SEQUENCE_ERROR);
        };
        let Some((&counter, data)) = args.split_first() else {
            return negative(sid, NRC_INCORRECT_LENGTH);
        };
        if counter != download.next_counter {
            return negative(sid, NRC_WRONG_BLOCK_SEQUENCE_COUNTER);
        }
        if data.len() > max_block_length
            || download.received.len() + data.len() > download.size as usize
        {
            return negative(sid, NRC_REQUEST_OUT_OF_RANGE);
        }
        download.received.extend_from_slice(data);
        download.next_counter = counter.wrapping_add(1);
        vec![positive(sid), counter]
    }

    // =========================================================================
    // Legacy flashloader
    // =========================================================================

    fn handle_legacy(&self, state: &mut NodeState, request: &[u8]) -> Vec<u8> {
        let Some((&cmd, params)) = request.split_first() else {
            return vec![legacy::ERROR_RESPONSE, 0, LEGACY_UNKNOWN_COMMAND];
        };
        if !state.in_flashloader {
            return vec![legacy::ERROR_RESPONSE, cmd, LEGACY_NOT_IN_FLASHLOADER];
        }
        let reject = |code| vec![legacy::ERROR_RESPONSE, cmd, code];

        let data = match cmd {
            command::GET_DEVICE_NAME => self.device_name.as_bytes().to_vec(),
            command::GET_FLASHLOADER_VERSION => self.flashloader_version.as_bytes().to_vec(),
            command::GET_INFO_BLOCKS => encode_info_blocks(&state.info_blocks),
            command::ERASE => {
                if params.len() != 8 {
                    return reject(LEGACY_OUT_OF_RANGE);
                }
                let address = u32::from_be_bytes([params[0], params[1], params[2], params[3]]);
                let size = u32::from_be_bytes([params[4], params[5], params[6], params[7]]);
                if !self.in_memory(address, size) {
                    return reject(LEGACY_OUT_OF_RANGE);
                }
                state.erased = Some((address, size));
                state.memory.insert(address, Vec::new());
                Vec::new()
            }
            command::WRITE => {
                let Some((start, size)) = state.erased else {
                    return reject(LEGACY_OUT_OF_RANGE);
                };
                if params.len() < 4 {
                    return reject(LEGACY_OUT_OF_RANGE);
                }
                let address = u32::from_be_bytes([params[0], params[1], params[2], params[3]]);
                let data = &params[4..];
                let written = state.memory.get(&start).map_or(0, Vec::len) as u32;
                // Writes must continue the erased range without gaps
                if address != start + written || written + data.len() as u32 > size {
                    return reject(LEGACY_OUT_OF_RANGE);
                }
                state.memory.entry(start).or_default().extend_from_slice(data);
                Vec::new()
            }
            command::FINISH => {
                state.erased = None;
                Vec::new()
            }
            command::RESET => {
                let response = vec![cmd | legacy::RESPONSE_FLAG];
                self.reset(state);
                return response;
            }
            _ => return reject(LEGACY_UNKNOWN_COMMAND),
        };

        let mut response = vec![cmd | legacy::RESPONSE_FLAG];
        response.extend_from_slice(&data);
        response
    }
}

fn positive(sid: u8) -> u8 {
    sid.wrapping_add(service_id::POSITIVE_RESPONSE_OFFSET)
}

fn negative(sid: u8, nrc: u8) -> Vec<u8> {
    vec![service_id::NEGATIVE_RESPONSE, sid, nrc]
}

// =============================================================================
// Network
// =============================================================================

#[derive(Debug)]
struct NetworkInner {
    local_bus: u8,
    bus_type: BusType,
    latency: Mutex<Duration>,
    nodes: RwLock<Vec<Arc<MockNode>>>,
    frames: broadcast::Sender<CanFrame>,
}

impl NetworkInner {
    /// Buses reachable from the local bus through enabled routes
    fn reachable_buses(&self) -> BTreeSet<u8> {
        let nodes = self.nodes.read();
        let mut reachable = BTreeSet::from([self.local_bus]);
        loop {
            let mut added = false;
            for node in nodes.iter().filter(|n| n.router) {
                if !node.addresses.iter().any(|a| reachable.contains(&a.bus_id)) {
                    continue;
                }
                let routes = node.state.lock().routing_to.clone();
                for bus in routes {
                    added |= reachable.insert(bus);
                }
            }
            if !added {
                return reachable;
            }
        }
    }

    fn node(&self, address: NodeAddress) -> Option<Arc<MockNode>> {
        self.nodes
            .read()
            .iter()
            .find(|n| n.addresses.contains(&address))
            .cloned()
    }

    fn is_reachable(&self, address: NodeAddress) -> bool {
        self.node(address).is_some() && self.reachable_buses().contains(&address.bus_id)
    }

    fn publish(&self, id: u32, payload: &[u8], tx: bool) {
        let len = payload.len().min(8);
        let mut frame = CanFrame::new(id, false, &payload[..len]);
        frame.tx = tx;
        // Nobody listening is fine
        let _ = self.frames.send(frame);
    }

    async fn exchange(&self, address: NodeAddress, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let node = self
            .node(address)
            .ok_or_else(|| TransportError::Timeout(format!("No response from node {}", address)))?;
        if !self.reachable_buses().contains(&address.bus_id) {
            return Err(TransportError::Unreachable(address.to_string()));
        }

        self.publish(REQUEST_BASE_ID + address.node_id as u32, request, true);
        let response = node
            .handle_request(request)
            .ok_or_else(|| TransportError::Timeout(format!("No response from node {}", address)))?;
        self.publish(RESPONSE_BASE_ID + address.node_id as u32, &response, false);
        debug!(node = %node.name, request = ?request, response = ?response, "Mock exchange");
        Ok(response)
    }
}

/// In-memory network implementing [`ConnectionTransport`]
#[derive(Debug, Clone)]
pub struct MockNetwork {
    inner: Arc<NetworkInner>,
}

impl MockNetwork {
    /// Network whose tester is attached to `local_bus`
    pub fn new(local_bus: u8) -> Self {
        let (frames, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(NetworkInner {
                local_bus,
                bus_type: BusType::Can,
                latency: Mutex::new(Duration::ZERO),
                nodes: RwLock::new(Vec::new()),
                frames,
            }),
        }
    }

    /// Delay applied to every unicast exchange
    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.lock() = latency;
    }

    pub fn add_node(&self, node: MockNode) -> Arc<MockNode> {
        let node = Arc::new(node);
        self.inner.nodes.write().push(node.clone());
        node
    }

    pub fn node(&self, name: &str) -> Option<Arc<MockNode>> {
        self.inner
            .nodes
            .read()
            .iter()
            .find(|n| n.name == name)
            .cloned()
    }

    pub fn local_bus(&self) -> u8 {
        self.inner.local_bus
    }
}

#[async_trait]
impl ConnectionTransport for MockNetwork {
    fn bus_type(&self) -> BusType {
        self.inner.bus_type
    }

    async fn broadcast(&self, request: &[u8]) -> Result<(), TransportError> {
        self.inner.publish(REQUEST_BASE_ID, request, true);
        let local: Vec<Arc<MockNode>> = self
            .inner
            .nodes
            .read()
            .iter()
            .filter(|n| n.has_bus(self.inner.local_bus))
            .cloned()
            .collect();
        for node in local {
            node.handle_broadcast(request);
        }
        Ok(())
    }

    async fn open_channel(
        &self,
        address: NodeAddress,
    ) -> Result<Arc<dyn TransportAdapter>, TransportError> {
        Ok(Arc::new(MockChannel {
            network: self.inner.clone(),
            address,
        }))
    }

    async fn reconnect(&self, address: NodeAddress) -> Result<(), TransportError> {
        if self.inner.is_reachable(address) {
            Ok(())
        } else {
            Err(TransportError::Unreachable(address.to_string()))
        }
    }

    fn subscribe_frames(&self) -> broadcast::Receiver<CanFrame> {
        self.inner.frames.subscribe()
    }
}

/// Point-to-point channel into a [`MockNetwork`]
struct MockChannel {
    network: Arc<NetworkInner>,
    address: NodeAddress,
}

#[async_trait]
impl TransportAdapter for MockChannel {
    async fn send_receive(
        &self,
        request: &[u8],
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.network.exchange(self.address, request).await
    }

    async fn send(&self, request: &[u8]) -> Result<(), TransportError> {
        self.network.exchange(self.address, request).await?;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.network.is_reachable(self.address)
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        if self.network.is_reachable(self.address) {
            Ok(())
        } else {
            Err(TransportError::Unreachable(self.address.to_string()))
        }
    }

    fn address_info(&self) -> AddressInfo {
        AddressInfo {
            tx_id: REQUEST_BASE_ID + self.address.node_id as u32,
            rx_id: RESPONSE_BASE_ID + self.address.node_id as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(bus_id: u8, node_id: u8) -> NodeAddress {
        NodeAddress { bus_id, node_id }
    }

    async fn ask(network: &MockNetwork, address: NodeAddress, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        let channel = network.open_channel(address).await.unwrap();
        channel.send_receive(request, Duration::from_millis(100)).await
    }

    #[tokio::test]
    async fn test_request_programming_and_reset() {
        let network = MockNetwork::new(0);
        let node = network.add_node(MockNode::diagnostic("A", "DEV-A").on(0, 1));

        // Application refuses the programming session
        let response = ask(&network, addr(0, 1), &[0x10, 0x02]).await.unwrap();
        assert_eq!(response, vec![0x7F, 0x10, 0x22]);

        network.broadcast(&[0x2E, 0xA8, 0x30, 0x01]).await.unwrap();
        network.broadcast(&[0x11, 0x01]).await.unwrap();
        assert!(node.is_in_flashloader());
        assert_eq!(node.reset_count(), 1);

        let response = ask(&network, addr(0, 1), &[0x10, 0x02]).await.unwrap();
        assert_eq!(response[..2], [0x50, 0x02]);

        // A plain reset returns to the application
        ask(&network, addr(0, 1), &[0x11, 0x01]).await.unwrap();
        assert!(!node.is_in_flashloader());
    }

    #[tokio::test]
    async fn test_routing_reaches_other_bus() {
        let network = MockNetwork::new(0);
        network.add_node(MockNode::diagnostic("R", "DEV-R").on(0, 1).on(1, 1).router().in_flashloader());
        network.add_node(MockNode::diagnostic("B", "DEV-B").on(1, 2));

        let err = ask(&network, addr(1, 2), &[0x22, 0xF1, 0x97]).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));

        let response = ask(&network, addr(0, 1), &[0x31, 0x01, 0x02, 0x01, 1]).await.unwrap();
        assert_eq!(response, vec![0x71, 0x01, 0x02, 0x01, 0x00]);

        let response = ask(&network, addr(1, 2), &[0x22, 0xF1, 0x97]).await.unwrap();
        assert_eq!(&response[3..], b"DEV-B");
    }

    #[tokio::test]
    async fn test_download_sequence() {
        let network = MockNetwork::new(0);
        let node = network.add_node(
            MockNode::diagnostic("A", "DEV-A")
                .on(0, 1)
                .in_flashloader()
                .with_max_block_length(4)
                .with_memory(0x1000, 0x100),
        );
        let a = addr(0, 1);
        ask(&network, a, &[0x10, 0x02]).await.unwrap();

        let out_of_range = [0x34, 0x00, 0x44, 0, 0, 0x20, 0, 0, 0, 0, 8];
        assert_eq!(ask(&network, a, &out_of_range).await.unwrap(), vec![0x7F, 0x34, 0x31]);

        let download = [0x34, 0x00, 0x44, 0, 0, 0x10, 0, 0, 0, 0, 6];
        assert_eq!(ask(&network, a, &download).await.unwrap(), vec![0x74, 0x20, 0x00, 0x06]);

        // Block too large, wrong counter, then the real sequence
        assert_eq!(ask(&network, a, &[0x36, 1, 1, 2, 3, 4, 5]).await.unwrap()[2], 0x31);
        assert_eq!(ask(&network, a, &[0x36, 2, 1]).await.unwrap()[2], 0x73);
        ask(&network, a, &[0x36, 1, 1, 2, 3, 4]).await.unwrap();
        assert_eq!(ask(&network, a, &[0x37]).await.unwrap()[2], 0x24);
        ask(&network, a, &[0x36, 2, 5, 6]).await.unwrap();
        assert_eq!(ask(&network, a, &[0x37]).await.unwrap(), vec![0x77]);

        let check = ask(&network, a, &[0x31, 0x01, 0x02, 0x02]).await.unwrap();
        assert_eq!(check[4], 0x00);
        assert_eq!(node.memory(0x1000), Some(vec![1, 2, 3, 4, 5, 6]));
    }

    #[tokio::test]
    async fn test_security_required_for_download() {
        let network = MockNetwork::new(0);
        let node = network.add_node(
            MockNode::diagnostic("A", "DEV-A")
                .on(0, 1)
                .in_flashloader()
                .with_secret(&[0xA5]),
        );
        let a = addr(0, 1);
        ask(&network, a, &[0x10, 0x02]).await.unwrap();
        let download = [0x34, 0x00, 0x44, 0, 0, 0, 0, 0, 0, 0, 1];
        assert_eq!(ask(&network, a, &download).await.unwrap()[2], 0x33);

        let seed = ask(&network, a, &[0x27, 0x01]).await.unwrap();
        assert_eq!(&seed[2..], &MOCK_SEED);
        assert_eq!(ask(&network, a, &[0x27, 0x02, 0, 0, 0, 0]).await.unwrap()[2], 0x35);

        ask(&network, a, &[0x27, 0x01]).await.unwrap();
        let mut key = vec![0x27, 0x02];
        key.extend(compute_key(&MOCK_SEED, &[0xA5]));
        assert_eq!(ask(&network, a, &key).await.unwrap(), vec![0x67, 0x02]);
        assert!(node.is_unlocked());
        assert_eq!(ask(&network, a, &download).await.unwrap()[0], 0x74);
    }

    #[tokio::test]
    async fn test_silent_and_missing_nodes() {
        let network = MockNetwork::new(0);
        let node = network.add_node(MockNode::diagnostic("A", "DEV-A").on(0, 1));
        node.set_responsive(false);
        assert!(matches!(
            ask(&network, addr(0, 1), &[0x3E, 0x00]).await,
            Err(TransportError::Timeout(_))
        ));
        assert!(matches!(
            ask(&network, addr(0, 9), &[0x3E, 0x00]).await,
            Err(TransportError::Timeout(_))
        ));
        assert!(network.reconnect(addr(0, 1)).await.is_ok());
        assert!(network.reconnect(addr(3, 1)).await.is_err());
    }

    #[tokio::test]
    async fn test_exchanges_are_published_as_frames() {
        let network = MockNetwork::new(0);
        network.add_node(MockNode::diagnostic("A", "DEV-A").on(0, 1));
        let mut frames = network.subscribe_frames();

        ask(&network, addr(0, 1), &[0x3E, 0x00]).await.unwrap();
        let request = frames.recv().await.unwrap();
        assert_eq!(request.id, 0x601);
        assert!(request.tx);
        assert_eq!(request.payload(), &[0x3E, 0x00]);
        let response = frames.recv().await.unwrap();
        assert_eq!(response.id, 0x581);
        assert_eq!(response.payload(), &[0x7E, 0x00]);
    }
}
