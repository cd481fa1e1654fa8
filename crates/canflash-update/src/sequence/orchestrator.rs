//! Multi-phase update of the nodes of one network
//!
//! The orchestrator runs one phase at a time:
//!
//! 1. [`activate_flashloader`](UpdateOrchestrator::activate_flashloader):
//!    bring every node with a flashloader into it, set up routing on the way
//!    and open a programming session
//! 2. [`read_device_info`](UpdateOrchestrator::read_device_info): collect
//!    device information and decide per node whether it needs an update
//! 3. [`update`](UpdateOrchestrator::update): write the package files in the
//!    caller's node order; the first failure stops the phase
//! 4. [`reset_system`](UpdateOrchestrator::reset_system): restart every node
//!    into its application
//!
//! Per-node failures during activation, device info and reset are recorded
//! in the node states and do not stop the phase. Every step is reported to
//! the progress sink and every report checks the abort flag.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use canflash_core::{
    find_route, CoreError, FlashloaderFamily, NetworkDescription, NodeAddress, ProgressEvent,
    ProgressSink, ProgressStep, ResultCode, Route, TracingSink,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::UpdateConfig;
use crate::device_info::{
    decode_flash_blocks, text_from_bytes, DeviceInfo, DeviceInfos, DiagDeviceInfo,
    LegacyDeviceInfo,
};
use crate::error::{UpdateError, UpdateResult};
use crate::image::FirmwareImage;
use crate::legacy::{self, LegacyService};
use crate::pem::PemFile;
use crate::session::{enter_programming_session, unlock};
use crate::state::{ConnectionStatus, NodeUpdate, UpdateFile, UpdateNodeState, UpdateStatus};
use crate::transport::ConnectionTransport;
use crate::uds::{
    ecu_reset_request, flashloader_did, flashloader_routine, reset_type, write_data_by_id_request,
    UdsService,
};

/// Phase the orchestrator is currently in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    ActivatingFlashloader,
    ReadingDeviceInfo,
    Updating,
    ResettingSystem,
}

/// Returns the orchestrator to idle when a phase ends
struct PhaseGuard<'a> {
    phase: &'a Mutex<Phase>,
    abort: &'a AtomicBool,
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.abort.store(false, Ordering::SeqCst);
        *self.phase.lock() = Phase::Idle;
    }
}

/// Channel to a node in the protocol of its flashloader
enum NodeLink {
    Diagnostic(UdsService),
    Legacy(LegacyService),
}

pub struct UpdateOrchestrator {
    description: Arc<NetworkDescription>,
    observed_bus: usize,
    transport: Arc<dyn ConnectionTransport>,
    config: UpdateConfig,
    progress: Arc<dyn ProgressSink>,
    abort: AtomicBool,
    phase: Mutex<Phase>,
    package: Mutex<BTreeMap<usize, Vec<UpdateFile>>>,
    states: Mutex<Vec<UpdateNodeState>>,
    device_infos: Mutex<DeviceInfos>,
}

impl UpdateOrchestrator {
    pub fn new(
        description: Arc<NetworkDescription>,
        observed_bus: usize,
        transport: Arc<dyn ConnectionTransport>,
        config: UpdateConfig,
    ) -> UpdateResult<Self> {
        if observed_bus >= description.buses.len() {
            return Err(UpdateError::Config(format!(
                "Observed bus index {} out of range ({} buses)",
                observed_bus,
                description.buses.len()
            )));
        }
        let states = vec![UpdateNodeState::default(); description.nodes.len()];
        Ok(Self {
            description,
            observed_bus,
            transport,
            config,
            progress: Arc::new(TracingSink),
            abort: AtomicBool::new(false),
            phase: Mutex::new(Phase::Idle),
            package: Mutex::new(BTreeMap::new()),
            states: Mutex::new(states),
            device_infos: Mutex::new(DeviceInfos::default()),
        })
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn description(&self) -> &NetworkDescription {
        &self.description
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    /// Replace the files to write; nodes are looked up by name
    pub fn set_package(&self, nodes: Vec<NodeUpdate>) -> UpdateResult<()> {
        let mut package = BTreeMap::new();
        for entry in nodes {
            let index = self
                .description
                .node_index_by_name(&entry.node)
                .ok_or_else(|| UpdateError::Config(format!("Unknown node '{}'", entry.node)))?;
            package.insert(index, entry.files);
        }
        *self.package.lock() = package;
        Ok(())
    }

    pub fn node_states(&self) -> Vec<UpdateNodeState> {
        self.states.lock().clone()
    }

    pub fn node_state(&self, node_index: usize) -> Option<UpdateNodeState> {
        self.states.lock().get(node_index).cloned()
    }

    /// Request cancellation; the running phase stops at its next report
    ///
    /// The request stays pending until a phase ends, so a phase that has
    /// not entered yet stops at its first report.
    pub fn abort(&self) {
        info!("Abort requested");
        self.abort.store(true, Ordering::SeqCst);
    }

    /// Drain the results of the last device info phase
    pub fn take_device_infos(&self) -> DeviceInfos {
        std::mem::take(&mut *self.device_infos.lock())
    }

    /// Drop a pending abort request; fails with [`UpdateError::Busy`] while a phase runs
    pub(crate) fn clear_abort(&self) -> UpdateResult<()> {
        let current = self.phase.lock();
        if *current != Phase::Idle {
            return Err(UpdateError::Busy);
        }
        self.abort.store(false, Ordering::SeqCst);
        Ok(())
    }

    // =========================================================================
    // Phase plumbing
    // =========================================================================

    fn enter(&self, phase: Phase) -> UpdateResult<PhaseGuard<'_>> {
        let mut current = self.phase.lock();
        if *current != Phase::Idle {
            return Err(UpdateError::Busy);
        }
        *current = phase;
        debug!(?phase, "Phase started");
        Ok(PhaseGuard {
            phase: &self.phase,
            abort: &self.abort,
        })
    }

    fn report(&self, event: ProgressEvent) -> UpdateResult<()> {
        self.progress.report(&event);
        if self.abort.load(Ordering::SeqCst) {
            return Err(UpdateError::Aborted);
        }
        Ok(())
    }

    fn finish(&self, step: ProgressStep, result: &UpdateResult<()>) {
        let event = match result {
            Ok(()) => ProgressEvent::new(step, "Finished").with_percent(100),
            Err(UpdateError::Aborted) => {
                ProgressEvent::new(ProgressStep::Aborted, "Aborted by user")
                    .with_result(ResultCode::Aborted)
            }
            Err(e) => ProgressEvent::new(step, e.to_string()).with_error(&CoreError::from(e.clone())),
        };
        self.progress.report(&event);
    }

    fn report_node_error(&self, step: ProgressStep, address: Option<NodeAddress>, err: &UpdateError) {
        let mut event =
            ProgressEvent::new(step, err.to_string()).with_error(&CoreError::from(err.clone()));
        if let Some(address) = address {
            event = event.with_node(address);
        }
        self.progress.report(&event);
    }

    fn update_state(&self, node_index: usize, f: impl FnOnce(&mut UpdateNodeState)) {
        if let Some(state) = self.states.lock().get_mut(node_index) {
            f(state);
        }
    }

    /// Nodes with a flashloader, nearest first; unreachable nodes last
    fn active_nodes(&self) -> Vec<(usize, Option<Route>)> {
        let mut nodes: Vec<(usize, Option<Route>)> = self
            .description
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.flashloader != FlashloaderFamily::None)
            .map(|(index, _)| (index, find_route(&self.description, self.observed_bus, index)))
            .collect();
        nodes.sort_by_key(|(index, route)| (route.as_ref().map_or(usize::MAX, Route::depth), *index));
        nodes
    }

    fn update_enabled(&self, node_index: usize) -> bool {
        self.description.nodes[node_index]
            .interfaces
            .iter()
            .any(|i| i.connected && i.update_enabled)
    }

    fn family(&self, node_index: usize) -> FlashloaderFamily {
        self.description.nodes[node_index].flashloader
    }

    fn target(&self, node_index: usize) -> UpdateResult<(Route, NodeAddress)> {
        let node = self
            .description
            .nodes
            .get(node_index)
            .ok_or_else(|| UpdateError::Config(format!("Node index {} out of range", node_index)))?;
        let route = find_route(&self.description, self.observed_bus, node_index).ok_or_else(|| {
            UpdateError::Communication(format!("Node '{}' is not reachable", node.name))
        })?;
        let address = route.target_address(&self.description).ok_or_else(|| {
            UpdateError::Config(format!("Node '{}' has no address on its bus", node.name))
        })?;
        Ok((route, address))
    }

    async fn link(&self, node_index: usize, address: NodeAddress) -> UpdateResult<NodeLink> {
        let channel = self.transport.open_channel(address).await?;
        let timeout = self.config.timeouts.request();
        match self.family(node_index) {
            FlashloaderFamily::Legacy => Ok(NodeLink::Legacy(
                LegacyService::new(channel).with_timeout(timeout),
            )),
            FlashloaderFamily::Diagnostic => Ok(NodeLink::Diagnostic(
                UdsService::new(channel).with_timeout(timeout),
            )),
            FlashloaderFamily::None => Err(UpdateError::Config(format!(
                "Node '{}' has no flashloader",
                self.description.nodes[node_index].name
            ))),
        }
    }

    // =========================================================================
    // Activate flashloader
    // =========================================================================

    /// Bring all nodes into their flashloader and open programming sessions
    pub async fn activate_flashloader(&self) -> UpdateResult<()> {
        let _guard = self.enter(Phase::ActivatingFlashloader)?;
        let result = self.run_activate().await;
        self.finish(ProgressStep::ActivateFlashloaderFinished, &result);
        result
    }

    async fn run_activate(&self) -> UpdateResult<()> {
        self.report(ProgressEvent::new(
            ProgressStep::ActivateFlashloaderStart,
            "Activating flashloaders",
        ))?;

        let nodes = self.active_nodes();
        {
            let mut states = self.states.lock();
            for state in states.iter_mut() {
                *state = UpdateNodeState::default();
            }
        }

        let has = |family| nodes.iter().any(|(i, _)| self.family(*i) == family);
        if has(FlashloaderFamily::Diagnostic) {
            self.report(ProgressEvent::new(
                ProgressStep::BroadcastEnterFlashloader,
                "Broadcast request programming and reset",
            ))?;
            self.transport
                .broadcast(&write_data_by_id_request(
                    flashloader_did::REQUEST_PROGRAMMING,
                    &[0x01],
                ))
                .await?;
            self.transport
                .broadcast(&ecu_reset_request(reset_type::HARD_RESET))
                .await?;
        }
        if has(FlashloaderFamily::Legacy) {
            self.report(ProgressEvent::new(
                ProgressStep::BroadcastEnterFlashloader,
                "Broadcast net reset and wake-up",
            ))?;
            self.transport
                .broadcast(&[legacy::command::NET_RESET])
                .await?;
            self.transport.broadcast(legacy::WAKE_UP).await?;
        }
        tokio::time::sleep(self.config.timeouts.flashloader_reset_wait()).await;

        for (index, route) in nodes {
            if !self.update_enabled(index) {
                self.update_state(index, |s| {
                    s.connection = ConnectionStatus::UpdateDisabled;
                    s.update = UpdateStatus::Disabled;
                });
                continue;
            }
            let Some(route) = route else {
                let err = UpdateError::Communication(format!(
                    "Node '{}' is not reachable",
                    self.description.nodes[index].name
                ));
                warn!(node = index, "{}", err);
                self.update_state(index, |s| s.set_error(err.to_string()));
                self.report_node_error(ProgressStep::RoutingSetup, None, &err);
                continue;
            };

            match self.activate_node(index, &route).await {
                Ok(()) => {}
                Err(UpdateError::Aborted) => return Err(UpdateError::Aborted),
                Err(err) => {
                    warn!(node = index, error = %err, "Flashloader activation failed");
                    self.update_state(index, |s| s.set_error(err.to_string()));
                    self.report_node_error(
                        ProgressStep::EnterProgrammingSession,
                        route.target_address(&self.description),
                        &err,
                    );
                }
            }
        }
        Ok(())
    }

    /// Enable forwarding on every router between the observed bus and the target
    async fn setup_routing(&self, route: &Route) -> UpdateResult<()> {
        for hop in &route.hops {
            let router = self
                .description
                .node_address(hop.node_index, hop.in_bus)
                .ok_or_else(|| UpdateError::Config("Router has no address on its input bus".to_string()))?;
            let out_bus = self.description.buses[hop.out_bus].id;
            self.report(
                ProgressEvent::new(
                    ProgressStep::RoutingSetup,
                    format!("Enable routing to bus {}", out_bus),
                )
                .with_node(router),
            )?;

            let uds = UdsService::new(self.transport.open_channel(router).await?)
                .with_timeout(self.config.timeouts.request());
            let status = uds
                .routine_control_start(flashloader_routine::ROUTING_ENABLE, &[out_bus])
                .await?;
            if status.first().is_some_and(|s| *s != 0) {
                return Err(UpdateError::Communication(format!(
                    "Router {} refused routing to bus {}",
                    router, out_bus
                )));
            }
        }
        Ok(())
    }

    async fn activate_node(&self, node_index: usize, route: &Route) -> UpdateResult<()> {
        let address = route.target_address(&self.description).ok_or_else(|| {
            UpdateError::Config(format!("Node {} has no address on its bus", node_index))
        })?;
        let family = self.family(node_index);
        if family == FlashloaderFamily::Legacy && !route.is_direct() {
            return Err(UpdateError::Config(
                "Legacy flashloaders can only be reached on the observed bus".to_string(),
            ));
        }

        self.setup_routing(route).await?;
        self.transport.reconnect(address).await?;

        match self.link(node_index, address).await? {
            NodeLink::Diagnostic(uds) => {
                if !route.is_direct() {
                    // The broadcast only reached the observed bus
                    uds.write_data_by_id(flashloader_did::REQUEST_PROGRAMMING, &[0x01])
                        .await?;
                    uds.ecu_reset(reset_type::HARD_RESET).await?;
                    tokio::time::sleep(self.config.timeouts.flashloader_reset_wait()).await;
                }

                self.report(
                    ProgressEvent::new(
                        ProgressStep::EnterProgrammingSession,
                        "Enter programming session",
                    )
                    .with_node(address),
                )?;
                enter_programming_session(&uds, &self.config.sessions).await?;

                if let Some(security) = &self.config.security {
                    self.report(
                        ProgressEvent::new(ProgressStep::SecurityAccess, "Security access")
                            .with_node(address),
                    )?;
                    unlock(&uds, security).await?;
                }
            }
            NodeLink::Legacy(service) => {
                self.report(
                    ProgressEvent::new(
                        ProgressStep::EnterProgrammingSession,
                        "Contact legacy flashloader",
                    )
                    .with_node(address),
                )?;
                service.device_name().await?;
            }
        }
        info!(node = %address, "Flashloader active");
        Ok(())
    }

    // =========================================================================
    // Read device information
    // =========================================================================

    /// Read device information of every active node and evaluate its status
    pub async fn read_device_info(&self) -> UpdateResult<()> {
        let _guard = self.enter(Phase::ReadingDeviceInfo)?;
        let result = self.run_read_device_info().await;
        self.finish(ProgressStep::ReadDeviceInfoFinished, &result);
        result
    }

    async fn run_read_device_info(&self) -> UpdateResult<()> {
        self.report(ProgressEvent::new(
            ProgressStep::ReadDeviceInfoStart,
            "Reading device information",
        ))?;
        *self.device_infos.lock() = DeviceInfos::default();

        for (index, _) in self.active_nodes() {
            let skip = self.states.lock().get(index).map_or(true, |s| {
                matches!(
                    s.connection,
                    ConnectionStatus::Error | ConnectionStatus::UpdateDisabled
                )
            });
            if skip {
                continue;
            }

            match self.read_node_info(index).await {
                Ok(info) => {
                    {
                        let mut infos = self.device_infos.lock();
                        match &info {
                            DeviceInfo::Diagnostic(diag) => infos.diagnostic.push((index, diag.clone())),
                            DeviceInfo::Legacy(old) => infos.legacy.push((index, old.clone())),
                        }
                    }
                    self.evaluate(index, info).await;
                }
                Err(UpdateError::Aborted) => return Err(UpdateError::Aborted),
                Err(err) => {
                    warn!(node = index, error = %err, "Reading device information failed");
                    self.update_state(index, |s| s.set_error(err.to_string()));
                    let address = self.target(index).ok().map(|(_, a)| a);
                    self.report_node_error(ProgressStep::ReadDeviceName, address, &err);
                }
            }
        }
        Ok(())
    }

    async fn read_node_info(&self, node_index: usize) -> UpdateResult<DeviceInfo> {
        let (_, address) = self.target(node_index)?;
        let event = |step, text: &str| ProgressEvent::new(step, text).with_node(address);

        match self.link(node_index, address).await? {
            NodeLink::Diagnostic(uds) => {
                self.report(event(ProgressStep::ReadDeviceName, "Read device name"))?;
                let device_name =
                    text_from_bytes(&uds.read_data_by_id(flashloader_did::DEVICE_NAME).await?);

                self.report(event(ProgressStep::ReadFlashloaderInfo, "Read flashloader information"))?;
                let flashloader_version = text_from_bytes(
                    &uds.read_data_by_id(flashloader_did::FLASHLOADER_VERSION)
                        .await?,
                );
                let max_block_length = read_max_block_length(&uds).await?;

                self.report(event(ProgressStep::ReadFlashBlocks, "Read flash blocks"))?;
                let table = uds.read_data_by_id(flashloader_did::FLASH_BLOCKS).await?;
                let flash_blocks = decode_flash_blocks(&table).ok_or_else(|| {
                    UpdateError::Communication("Malformed flash block table".to_string())
                })?;

                Ok(DeviceInfo::Diagnostic(DiagDeviceInfo {
                    device_name,
                    flashloader_version,
                    max_block_length,
                    flash_blocks,
                }))
            }
            NodeLink::Legacy(service) => {
                self.report(event(ProgressStep::ReadDeviceName, "Read device name"))?;
                let device_name = service.device_name().await?;
                self.report(event(ProgressStep::ReadFlashloaderInfo, "Read flashloader version"))?;
                let flashloader_version = service.flashloader_version().await?;
                self.report(event(ProgressStep::ReadInfoBlocks, "Read info blocks"))?;
                let info_blocks = service.info_blocks().await?;

                Ok(DeviceInfo::Legacy(LegacyDeviceInfo {
                    device_name,
                    flashloader_version,
                    info_blocks,
                }))
            }
        }
    }

    /// Decide whether a node needs an update
    ///
    /// Firmware files whose application is already on the node are skipped;
    /// a node with nothing left to write matches its package.
    async fn evaluate(&self, node_index: usize, info: DeviceInfo) {
        let files = self
            .package
            .lock()
            .get(&node_index)
            .cloned()
            .unwrap_or_default();

        let mut skip_files = std::collections::BTreeSet::new();
        for (file_index, file) in files.iter().enumerate() {
            let UpdateFile::Firmware { path } = file else {
                continue;
            };
            // Unreadable files are reported by the update phase
            let Ok(image) = read_image(path).await else {
                continue;
            };
            if image.device_name == info.device_name()
                && info.has_application(&image.application_name, &image.application_version)
            {
                debug!(node = node_index, file = file_index, "Application already present");
                skip_files.insert(file_index);
            }
        }

        let up_to_date = skip_files.len() == files.len();
        self.update_state(node_index, |s| {
            s.connection = if up_to_date {
                ConnectionStatus::ApplicationMatch
            } else {
                ConnectionStatus::ToBeUpdated
            };
            s.update = if up_to_date {
                UpdateStatus::UpToDate
            } else {
                UpdateStatus::Waiting
            };
            s.skip_files = skip_files;
            s.device_info = Some(info);
            s.last_error = None;
        });
    }

    // =========================================================================
    // Update
    // =========================================================================

    /// Write the package to the nodes in `order` (node indices)
    ///
    /// Stops at the first failure; the error carries the position in `order`
    /// and the index of the failed file.
    pub async fn update(&self, order: &[usize]) -> UpdateResult<()> {
        let _guard = self.enter(Phase::Updating)?;
        let result = self.run_update(order).await;
        self.finish(ProgressStep::UpdateFinished, &result);
        result
    }

    async fn run_update(&self, order: &[usize]) -> UpdateResult<()> {
        if let Some(bad) = order.iter().find(|i| **i >= self.description.nodes.len()) {
            return Err(UpdateError::Config(format!(
                "Node index {} out of range",
                bad
            )));
        }
        self.report(ProgressEvent::new(ProgressStep::UpdateStart, "Updating nodes"))?;

        for (position, &node_index) in order.iter().enumerate() {
            let state = self.node_state(node_index).unwrap_or_default();
            if state.connection == ConnectionStatus::UpdateDisabled {
                debug!(node = node_index, "Update disabled, skipped");
                continue;
            }
            let files = self
                .package
                .lock()
                .get(&node_index)
                .cloned()
                .unwrap_or_default();

            if let Err(err) = self.update_node(node_index, &files, &state).await {
                let err = match err {
                    UpdateError::Aborted => err,
                    UpdateError::AtFile {
                        file_index, source, ..
                    } => UpdateError::AtFile {
                        node_position: position,
                        file_index,
                        source,
                    },
                    // Failures before the first file count against it
                    other => other.at_file(position, 0),
                };
                self.update_state(node_index, |s| {
                    s.update = UpdateStatus::Unknown;
                    s.last_error = Some(err.to_string());
                });
                return Err(err);
            }
        }
        Ok(())
    }

    async fn update_node(
        &self,
        node_index: usize,
        files: &[UpdateFile],
        state: &UpdateNodeState,
    ) -> UpdateResult<()> {
        let (_, address) = self.target(node_index)?;
        self.report(
            ProgressEvent::new(
                ProgressStep::UpdateNodeStart,
                format!("Updating '{}'", self.description.nodes[node_index].name),
            )
            .with_node(address),
        )?;
        self.update_state(node_index, |s| s.update = UpdateStatus::Updating);

        let link = self.link(node_index, address).await?;
        for (file_index, file) in files.iter().enumerate() {
            if state.skip_files.contains(&file_index) {
                debug!(node = node_index, file = file_index, "File already on node, skipped");
                continue;
            }
            let result = match &link {
                NodeLink::Diagnostic(uds) => {
                    self.write_diagnostic_file(uds, address, file, state).await
                }
                NodeLink::Legacy(service) => {
                    self.write_legacy_file(service, address, file, state).await
                }
            };
            result.map_err(|e| e.at_file(0, file_index))?;
        }

        self.update_state(node_index, |s| s.update = UpdateStatus::Success);
        self.report(
            ProgressEvent::new(ProgressStep::UpdateNodeFinished, "Node updated").with_node(address),
        )?;
        Ok(())
    }

    fn check_device_name(&self, image: &FirmwareImage, actual: &str) -> UpdateResult<()> {
        if image.device_name != actual {
            return Err(UpdateError::DeviceNameMismatch {
                expected: image.device_name.clone(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }

    async fn open_firmware(&self, path: &Path, address: NodeAddress) -> UpdateResult<FirmwareImage> {
        self.report(
            ProgressEvent::new(ProgressStep::FirmwareOpen, path.display().to_string())
                .with_node(address),
        )?;
        let image = read_image(path).await?;
        self.report(
            ProgressEvent::new(ProgressStep::FirmwareSignature, "Verify signature")
                .with_node(address),
        )?;
        image.verify_signature()?;
        Ok(image)
    }

    fn transfer_event(&self, address: NodeAddress, done: u64, total: u64) -> ProgressEvent {
        let percent = if total == 0 { 100 } else { (done * 100 / total) as u8 };
        ProgressEvent::new(ProgressStep::FirmwareTransfer, format!("{} / {} bytes", done, total))
            .with_percent(percent)
            .with_node(address)
    }

    async fn write_diagnostic_file(
        &self,
        uds: &UdsService,
        address: NodeAddress,
        file: &UpdateFile,
        state: &UpdateNodeState,
    ) -> UpdateResult<()> {
        let timeouts = &self.config.timeouts;
        match file {
            UpdateFile::Firmware { path } => {
                let image = self.open_firmware(path, address).await?;

                self.report(
                    ProgressEvent::new(ProgressStep::FirmwareDeviceName, "Check device name")
                        .with_node(address),
                )?;
                let actual = match &state.device_info {
                    Some(info) => info.device_name().to_string(),
                    None => text_from_bytes(&uds.read_data_by_id(flashloader_did::DEVICE_NAME).await?),
                };
                self.check_device_name(&image, &actual)?;

                let total = image.total_size();
                let mut done = 0u64;
                for area in &image.areas {
                    self.report(
                        ProgressEvent::new(
                            ProgressStep::FirmwareErase,
                            format!("Erase 0x{:08X}, {} bytes", area.address, area.size()),
                        )
                        .with_node(address),
                    )?;
                    let block = uds
                        .request_download(area.address, area.size(), timeouts.request_download())
                        .await? as usize;
                    if block == 0 {
                        return Err(UpdateError::Communication(
                            "Node reported a zero block length".to_string(),
                        ));
                    }

                    let mut counter = self.config.block_counter_start;
                    for chunk in area.data.chunks(block) {
                        uds.transfer_data(counter, chunk, timeouts.transfer_data())
                            .await?;
                        counter = self.config.next_block_counter(counter);
                        done += chunk.len() as u64;
                        self.report(self.transfer_event(address, done, total))?;
                    }

                    self.report(
                        ProgressEvent::new(ProgressStep::FirmwareExit, "Transfer exit")
                            .with_node(address),
                    )?;
                    uds.request_transfer_exit().await?;
                }

                self.report(
                    ProgressEvent::new(ProgressStep::FirmwareCheck, "Check flash memory")
                        .with_node(address),
                )?;
                let status = uds
                    .routine_control_start(flashloader_routine::CHECK_FLASH_MEMORY, &[])
                    .await?;
                match status.first() {
                    Some(0x00) => {}
                    other => {
                        return Err(UpdateError::SignatureInvalid(format!(
                            "Flash check reported {:02X?}",
                            other
                        )))
                    }
                }
                info!(node = %address, application = %image.application_name, "Firmware written");
            }
            UpdateFile::ParameterSet { path } => {
                self.report(
                    ProgressEvent::new(ProgressStep::ParameterSetSizeCheck, path.display().to_string())
                        .with_node(address),
                )?;
                let data = tokio::fs::read(path).await?;
                let max_block_length = match &state.device_info {
                    Some(DeviceInfo::Diagnostic(info)) => info.max_block_length,
                    _ => read_max_block_length(uds).await?,
                };
                if data.len() as u64 > max_block_length as u64 {
                    return Err(UpdateError::MemoryRange(format!(
                        "Parameter set has {} bytes, node accepts {}",
                        data.len(),
                        max_block_length
                    )));
                }

                self.report(
                    ProgressEvent::new(ProgressStep::ParameterSetWrite, "Write parameter set")
                        .with_node(address),
                )?;
                uds.write_data_by_id(flashloader_did::PARAMETER_SET, &data)
                    .await?;
            }
            UpdateFile::Pem { path } => {
                self.report(
                    ProgressEvent::new(ProgressStep::CertificateRead, path.display().to_string())
                        .with_node(address),
                )?;
                let text = tokio::fs::read_to_string(path).await?;
                let pem = PemFile::parse(&text)?;

                self.report(
                    ProgressEvent::new(
                        ProgressStep::CertificateWrite,
                        format!("Write {} key material", pem.label),
                    )
                    .with_node(address),
                )?;
                uds.write_data_by_id(flashloader_did::CERTIFICATE_KEY, pem.key_material())
                    .await?;
            }
            UpdateFile::SecurityState { security, debugger } => {
                let writes = [
                    (flashloader_did::SECURITY_STATE, security.as_byte(), "security"),
                    (flashloader_did::DEBUGGER_STATE, debugger.as_byte(), "debugger"),
                ];
                for (did, value, what) in writes {
                    let Some(value) = value else {
                        continue;
                    };
                    self.report(
                        ProgressEvent::new(
                            ProgressStep::SecurityStateWrite,
                            format!("Set {} state to {}", what, value),
                        )
                        .with_node(address),
                    )?;
                    uds.write_data_by_id(did, &[value]).await?;
                }
            }
        }
        Ok(())
    }

    async fn write_legacy_file(
        &self,
        service: &LegacyService,
        address: NodeAddress,
        file: &UpdateFile,
        state: &UpdateNodeState,
    ) -> UpdateResult<()> {
        let UpdateFile::Firmware { path } = file else {
            return Err(UpdateError::Config(
                "Legacy flashloaders only accept firmware files".to_string(),
            ));
        };
        let timeouts = &self.config.timeouts;
        let image = self.open_firmware(path, address).await?;

        self.report(
            ProgressEvent::new(ProgressStep::FirmwareDeviceName, "Check device name")
                .with_node(address),
        )?;
        let actual = match &state.device_info {
            Some(info) => info.device_name().to_string(),
            None => service.device_name().await?,
        };
        self.check_device_name(&image, &actual)?;

        let total = image.total_size();
        let mut done = 0u64;
        for area in &image.areas {
            self.report(
                ProgressEvent::new(
                    ProgressStep::FirmwareErase,
                    format!("Erase 0x{:08X}, {} bytes", area.address, area.size()),
                )
                .with_node(address),
            )?;
            service
                .erase(area.address, area.size(), timeouts.request_download())
                .await?;

            let mut offset = area.address;
            for chunk in area.data.chunks(legacy::WRITE_CHUNK_SIZE) {
                service
                    .write(offset, chunk, timeouts.transfer_data())
                    .await?;
                offset += chunk.len() as u32;
                done += chunk.len() as u64;
                self.report(self.transfer_event(address, done, total))?;
            }
        }

        self.report(
            ProgressEvent::new(ProgressStep::FirmwareExit, "Finish programming").with_node(address),
        )?;
        service.finish().await?;
        Ok(())
    }

    // =========================================================================
    // Reset
    // =========================================================================

    /// Restart all nodes into their applications
    pub async fn reset_system(&self) -> UpdateResult<()> {
        let _guard = self.enter(Phase::ResettingSystem)?;
        let result = self.run_reset().await;
        self.finish(ProgressStep::ResetFinished, &result);
        result
    }

    async fn run_reset(&self) -> UpdateResult<()> {
        self.report(ProgressEvent::new(ProgressStep::ResetStart, "Resetting system"))?;

        let nodes = self.active_nodes();
        let mut routed: Vec<(usize, Route)> = nodes
            .iter()
            .filter_map(|(index, route)| route.clone().map(|r| (*index, r)))
            .filter(|(index, route)| !route.is_direct() && self.update_enabled(*index))
            .collect();
        // Deepest first so routers stay up while their subnets are reset
        routed.sort_by_key(|(index, route)| (std::cmp::Reverse(route.depth()), *index));

        for (index, route) in routed {
            let Some(address) = route.target_address(&self.description) else {
                continue;
            };
            self.report(
                ProgressEvent::new(ProgressStep::ResetNode, "Reset node").with_node(address),
            )?;
            let result = match self.link(index, address).await {
                Ok(NodeLink::Diagnostic(uds)) => uds
                    .ecu_reset(reset_type::HARD_RESET)
                    .await
                    .map(|_| ())
                    .map_err(UpdateError::from),
                Ok(NodeLink::Legacy(service)) => service.reset().await.map_err(UpdateError::from),
                Err(e) => Err(e),
            };
            if let Err(err) = result {
                warn!(node = %address, error = %err, "Node reset failed");
                self.update_state(index, |s| s.last_error = Some(err.to_string()));
                self.report_node_error(ProgressStep::ResetNode, Some(address), &err);
            }
        }

        self.report(ProgressEvent::new(
            ProgressStep::ResetBroadcast,
            "Broadcast reset on local bus",
        ))?;
        let has = |family| nodes.iter().any(|(i, _)| self.family(*i) == family);
        if has(FlashloaderFamily::Diagnostic) {
            self.transport
                .broadcast(&ecu_reset_request(reset_type::HARD_RESET))
                .await?;
        }
        if has(FlashloaderFamily::Legacy) {
            self.transport
                .broadcast(&[legacy::command::NET_RESET])
                .await?;
        }

        tokio::time::sleep(self.config.timeouts.reset_settle()).await;
        Ok(())
    }
}

async fn read_image(path: &Path) -> UpdateResult<FirmwareImage> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| UpdateError::Io(format!("{}: {}", path.display(), e)))?;
    Ok(FirmwareImage::parse(&bytes)?)
}

async fn read_max_block_length(uds: &UdsService) -> UpdateResult<u32> {
    let data = uds.read_data_by_id(flashloader_did::MAX_BLOCK_LENGTH).await?;
    let bytes: [u8; 4] = data.as_slice().try_into().map_err(|_| {
        UpdateError::Communication(format!("Max block length has {} bytes", data.len()))
    })?;
    Ok(u32::from_be_bytes(bytes))
}
