//! Frame interpretation pipeline
//!
//! [`FrameInterpreter::handle_frame`] runs every raw frame through filter,
//! description lookup, signal decode, safety checks and raw protocol fallback,
//! then hands the result to all open trace files and the received queue.
//!
//! State is split into four independently locked sections: the received queue,
//! configuration (descriptions, filters, trace files, protocol), scalar bus
//! metadata, and counters (occurrence tables, filtered count, safety tracker,
//! timestamps). A call never holds two of them at once, so the transport's
//! frame path and slow configuration calls from other threads do not block
//! each other for longer than one section access.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, Timelike};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use canflash_core::{
    CanFrame, CoreResult, MessageMatch, MuxRole, NetworkDescription, NetworkDescriptionRegistry,
    NodeIdentity, ProtocolKind, STANDARD_ID_COUNT,
};

use crate::codec::{BitLayout, Scaling, SignalCodec};
use crate::config::InterpreterConfig;
use crate::error::TraceResult;
use crate::filter::{FilterRule, MessageFilter};
use crate::interpreted::{InterpretedFrame, InterpretedSignal, DAY_US};
use crate::protocols::RawProtocol;
use crate::safety::{SafetyMessageTracker, CHECKSUM_SIGNAL, COUNTER_SIGNAL};
use crate::sink::{TraceFormat, TraceOptions, TraceSink, TraceWriter};

/// Frames kept for [`FrameInterpreter::take_received`]; older ones are dropped
pub const MAX_QUEUED_FRAMES: usize = 4096;

/// Bus statistics reported by the transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusMetadata {
    pub bus_load_percent: u8,
    pub tx_count: u32,
    pub tx_errors: u32,
}

struct ConfigSection {
    registry: NetworkDescriptionRegistry,
    filter: MessageFilter,
    log_files: BTreeMap<PathBuf, TraceSink>,
    protocol: RawProtocol,
    trace_options: TraceOptions,
}

struct CounterSection {
    /// Occurrences per 11-bit identifier
    standard: Box<[u32; STANDARD_ID_COUNT]>,
    extended: HashMap<u32, u32>,
    filtered: u32,
    tracker: SafetyMessageTracker,
    first_us: Option<u64>,
    last_us: Option<u64>,
    start_time_of_day_us: u64,
    running: bool,
}

impl CounterSection {
    fn new() -> Self {
        Self {
            standard: Box::new([0; STANDARD_ID_COUNT]),
            extended: HashMap::new(),
            filtered: 0,
            tracker: SafetyMessageTracker::new(),
            first_us: None,
            last_us: None,
            start_time_of_day_us: 0,
            running: false,
        }
    }

    fn reset(&mut self) {
        self.standard.fill(0);
        self.extended.clear();
        self.filtered = 0;
        self.tracker.reset();
        self.first_us = None;
        self.last_us = None;
    }

    fn count(&mut self, frame: &CanFrame) -> u32 {
        let slot = if !frame.extended && (frame.id as usize) < STANDARD_ID_COUNT {
            &mut self.standard[frame.id as usize]
        } else {
            self.extended.entry(frame.id).or_insert(0)
        };
        *slot = slot.saturating_add(1);
        *slot
    }

    fn stamp(&mut self, out: &mut InterpretedFrame) {
        let ts = out.frame.timestamp_us;
        let first = *self.first_us.get_or_insert(ts);
        out.absolute_us = ts.saturating_sub(first);
        out.relative_us = self.last_us.map(|l| ts.saturating_sub(l)).unwrap_or(0);
        out.time_of_day_us = (self.start_time_of_day_us + out.absolute_us) % DAY_US;
        self.last_us = Some(ts);
    }
}

/// What the counters section must do after a successful decode
enum SafetyAction {
    None,
    Primary,
    Eces { counter: i64 },
}

pub struct FrameInterpreter {
    received: Mutex<VecDeque<InterpretedFrame>>,
    config: Mutex<ConfigSection>,
    metadata: Mutex<BusMetadata>,
    counters: Mutex<CounterSection>,
}

impl Default for FrameInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameInterpreter {
    pub fn new() -> Self {
        Self {
            received: Mutex::new(VecDeque::new()),
            config: Mutex::new(ConfigSection {
                registry: NetworkDescriptionRegistry::new(),
                filter: MessageFilter::new(),
                log_files: BTreeMap::new(),
                protocol: RawProtocol::default(),
                trace_options: TraceOptions::default(),
            }),
            metadata: Mutex::new(BusMetadata::default()),
            counters: Mutex::new(CounterSection::new()),
        }
    }

    pub fn from_config(config: &InterpreterConfig) -> Self {
        let interpreter = Self::new();
        {
            let mut section = interpreter.config.lock();
            section.protocol = config.protocol;
            for rule in &config.filters {
                section.filter.add(*rule);
            }
            section.trace_options.hex = config.hex_mode;
            section.trace_options.absolute_timestamps = config.absolute_timestamps;
        }
        interpreter
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Reset counters and timestamps and begin a new measurement
    pub fn start(&self) {
        let now = Local::now();
        let time_of_day_us = now.num_seconds_from_midnight() as u64 * 1_000_000
            + (now.nanosecond() % 1_000_000_000) as u64 / 1_000;
        {
            let mut counters = self.counters.lock();
            counters.reset();
            counters.start_time_of_day_us = time_of_day_us;
            counters.running = true;
        }
        self.received.lock().clear();
        info!("Frame interpretation started");
    }

    /// End the measurement; counters, safety state and timestamps are reset
    pub fn stop(&self) {
        let mut counters = self.counters.lock();
        counters.reset();
        counters.running = false;
        info!("Frame interpretation stopped");
    }

    pub fn is_running(&self) -> bool {
        self.counters.lock().running
    }

    // =========================================================================
    // Frame path
    // =========================================================================

    /// Interpret one frame; `None` when a filter rejected it
    pub fn handle_frame(&self, frame: CanFrame) -> Option<InterpretedFrame> {
        let protocol = {
            let config = self.config.lock();
            if config.filter.accepts(&frame) {
                Some(config.protocol)
            } else {
                None
            }
        };
        let Some(protocol) = protocol else {
            let mut counters = self.counters.lock();
            counters.filtered = counters.filtered.saturating_add(1);
            return None;
        };

        let mut out = InterpretedFrame::new(frame);
        {
            let mut counters = self.counters.lock();
            out.counter = counters.count(&frame);
            counters.stamp(&mut out);
        }

        let action = {
            let config = self.config.lock();
            let action = config
                .registry
                .find_message(frame.id, frame.extended)
                .map(|m| decode_message(&m, &mut out));
            action
        };

        match action {
            Some(SafetyAction::Primary) => {
                let mut counters = self.counters.lock();
                counters.tracker.remember_primary(&frame, &out.message_name);
            }
            Some(SafetyAction::Eces { counter }) => {
                let mut counters = self.counters.lock();
                out.status = counters
                    .tracker
                    .validate_eces(frame.id, counter, &frame.data);
            }
            Some(SafetyAction::None) => {}
            None => {
                if let Some(text) = protocol.decode(&frame, true) {
                    out.protocol_text_hex = text;
                    out.protocol_text_dec = protocol.decode(&frame, false).unwrap_or_default();
                } else {
                    let counters = self.counters.lock();
                    if let Some(status) = counters.tracker.check_inverted(&frame) {
                        out.status = status.to_string();
                    }
                }
            }
        }

        out.sort_signals();

        {
            let mut config = self.config.lock();
            for (path, sink) in config.log_files.iter_mut() {
                if let Err(e) = sink.add_message(&out) {
                    warn!(path = %path.display(), error = %e, "Failed to write trace record");
                }
            }
        }

        {
            let mut received = self.received.lock();
            if received.len() >= MAX_QUEUED_FRAMES {
                received.pop_front();
            }
            received.push_back(out.clone());
        }

        Some(out)
    }

    /// Drain the frames interpreted since the last call
    pub fn take_received(&self) -> Vec<InterpretedFrame> {
        self.received.lock().drain(..).collect()
    }

    /// Occurrences of an identifier since start
    pub fn frame_count(&self, id: u32, extended: bool) -> u32 {
        let counters = self.counters.lock();
        if !extended && (id as usize) < STANDARD_ID_COUNT {
            counters.standard[id as usize]
        } else {
            counters.extended.get(&id).copied().unwrap_or(0)
        }
    }

    /// Feed frames from a transport's broadcast stream until it closes
    pub fn attach(self: &Arc<Self>, mut frames: broadcast::Receiver<CanFrame>) -> JoinHandle<()> {
        let interpreter = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(frame) => {
                        interpreter.handle_frame(frame);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Frame stream lagged, frames lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Frame stream closed");
                        break;
                    }
                }
            }
        })
    }

    // =========================================================================
    // Network descriptions
    // =========================================================================

    pub fn add_database(
        &self,
        path: impl Into<String>,
        description: Arc<NetworkDescription>,
        bus_index: usize,
    ) -> CoreResult<()> {
        self.config.lock().registry.add(path, description, bus_index)
    }

    /// Load a description file and register it under its path
    pub fn load_database(&self, path: impl AsRef<Path>, bus_index: usize) -> CoreResult<()> {
        let path = path.as_ref();
        let description = NetworkDescription::load(path)?;
        self.add_database(path.display().to_string(), Arc::new(description), bus_index)
    }

    pub fn remove_database(&self, path: &str) -> bool {
        self.config.lock().registry.remove(path)
    }

    pub fn set_database_active(&self, path: &str, active: bool) -> CoreResult<()> {
        self.config.lock().registry.set_active(path, active)
    }

    pub fn set_database_bus_index(&self, path: &str, bus_index: usize) -> CoreResult<()> {
        self.config.lock().registry.set_bus_index(path, bus_index)
    }

    pub fn database_count(&self) -> usize {
        self.config.lock().registry.len()
    }

    pub fn resolve_node(&self, bus_id: u8, node_id: u8) -> Option<NodeIdentity> {
        self.config.lock().registry.resolve_node(bus_id, node_id)
    }

    // =========================================================================
    // Filters
    // =========================================================================

    pub fn add_filter(&self, rule: FilterRule) {
        self.config.lock().filter.add(rule);
    }

    pub fn remove_filter(&self, rule: &FilterRule) -> bool {
        self.config.lock().filter.remove(rule)
    }

    pub fn remove_all_filters(&self) {
        self.config.lock().filter.clear();
    }

    /// Frames rejected by filters since start; saturates
    pub fn filtered_count(&self) -> u32 {
        self.counters.lock().filtered
    }

    // =========================================================================
    // Trace files
    // =========================================================================

    /// Open a trace file; the format follows the extension unless given
    ///
    /// Returns the final path, which is also the key for removal.
    pub fn add_log_file(
        &self,
        path: impl AsRef<Path>,
        format: Option<TraceFormat>,
    ) -> TraceResult<PathBuf> {
        let path = path.as_ref();
        let format = format
            .or_else(|| TraceFormat::from_path(path))
            .unwrap_or(TraceFormat::Asc);
        let options = self.config.lock().trace_options;

        let mut sink = TraceSink::new(format, options);
        let final_path = sink.open(path)?;
        self.config.lock().log_files.insert(final_path.clone(), sink);
        Ok(final_path)
    }

    pub fn remove_log_file(&self, path: &Path) -> bool {
        // Dropping the sink writes the footer
        let removed = self.config.lock().log_files.remove(path);
        removed.is_some()
    }

    pub fn remove_all_log_files(&self) {
        let sinks = std::mem::take(&mut self.config.lock().log_files);
        if !sinks.is_empty() {
            debug!(count = sinks.len(), "Closing trace files");
        }
        drop(sinks);
    }

    pub fn log_file_count(&self) -> usize {
        self.config.lock().log_files.len()
    }

    /// Options used by trace files opened from now on
    pub fn set_trace_options(&self, options: TraceOptions) {
        self.config.lock().trace_options = options;
    }

    // =========================================================================
    // Protocol and metadata
    // =========================================================================

    pub fn set_protocol(&self, protocol: RawProtocol) {
        self.config.lock().protocol = protocol;
    }

    pub fn protocol(&self) -> RawProtocol {
        self.config.lock().protocol
    }

    pub fn set_bus_load(&self, percent: u8) {
        self.metadata.lock().bus_load_percent = percent.min(100);
    }

    pub fn set_tx_count(&self, count: u32) {
        self.metadata.lock().tx_count = count;
    }

    pub fn set_tx_errors(&self, count: u32) {
        self.metadata.lock().tx_errors = count;
    }

    pub fn bus_metadata(&self) -> BusMetadata {
        *self.metadata.lock()
    }
}

/// Decode all signals of a matched message into `out`
fn decode_message(found: &MessageMatch<'_>, out: &mut InterpretedFrame) -> SafetyAction {
    let frame = out.frame;
    let message = found.message;
    out.message_name = message.name.clone();
    out.dlc_error = frame.dlc != message.dlc;

    let mut counter = None;
    let mut has_checksum = false;
    let mut mux_value = None;

    // Multiplexers first; their raw value selects the multiplexed group
    let (multiplexers, others): (Vec<_>, Vec<_>) = message
        .signals
        .iter()
        .partition(|s| s.mux == MuxRole::Multiplexer);

    for signal in multiplexers.into_iter().chain(others) {
        if let MuxRole::Multiplexed(value) = signal.mux {
            if mux_value != Some(value as i64) {
                continue;
            }
        }
        let Some(element) = found.element(signal) else {
            continue;
        };

        let codec = SignalCodec::new(BitLayout {
            start_bit: signal.start_bit,
            bit_length: signal.bit_length,
            byte_order: signal.byte_order,
            mux: signal.mux,
        });
        let decoded = codec.decode(&frame.data, frame.dlc, &Scaling::from(element));

        if signal.mux == MuxRole::Multiplexer && mux_value.is_none() {
            mux_value = decoded.raw;
        }
        if element.name == COUNTER_SIGNAL {
            counter = decoded.raw;
        } else if element.name == CHECKSUM_SIGNAL {
            has_checksum = true;
        }

        out.signals.push(InterpretedSignal::from_decoded(
            element.name.clone(),
            element.unit.clone(),
            element.comment.clone(),
            decoded,
        ));
    }

    if found.protocol == ProtocolKind::Ecos {
        return SafetyAction::Primary;
    }
    match counter {
        Some(counter) if has_checksum => SafetyAction::Eces { counter },
        _ => SafetyAction::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use canflash_core::{
        Bus, BusType, CanMessage, CanSignal, ComInterface, ComProtocol, Datapool,
        DatapoolElement, DatapoolList, ElementRef, FlashloaderFamily, InterfaceMessages, Node,
        SignalByteOrder, ValueType,
    };

    use crate::codec::encode_raw;
    use crate::safety::{crc8, STATUS_INVERTED_INVALID, STATUS_INVERTED_OK};

    fn element(name: &str, unit: &str) -> DatapoolElement {
        DatapoolElement {
            name: name.to_string(),
            unit: unit.to_string(),
            comment: String::new(),
            factor: 1.0,
            offset: 0.0,
            min: 0.0,
            max: 0.0,
            value_type: ValueType::U8,
            value_table: BTreeMap::new(),
        }
    }

    fn signal(start_bit: u16, bit_length: u16, mux: MuxRole, element_index: usize) -> CanSignal {
        CanSignal {
            start_bit,
            bit_length,
            byte_order: SignalByteOrder::Intel,
            mux,
            element: ElementRef {
                list_index: 0,
                element_index,
            },
        }
    }

    fn message(name: &str, can_id: u32, signals: Vec<CanSignal>) -> CanMessage {
        CanMessage {
            name: name.to_string(),
            can_id,
            extended: false,
            dlc: 8,
            signals,
        }
    }

    /// One node on bus 0 with a layer 2, an ECeS and an ECoS message
    fn description() -> NetworkDescription {
        let elements = vec![
            element("Speed", "km/h"),         // 0
            element("Mode", ""),              // 1
            element("Temp", "degC"),          // 2
            element("Pressure", "bar"),       // 3
            element(COUNTER_SIGNAL, ""),      // 4
            element(CHECKSUM_SIGNAL, ""),     // 5
            element("SafeValue", ""),         // 6
        ];
        let layer2 = vec![
            message(
                "Status",
                0x100,
                vec![
                    signal(16, 8, MuxRole::Plain, 0),
                    signal(0, 8, MuxRole::Multiplexer, 1),
                    signal(8, 8, MuxRole::Multiplexed(1), 2),
                    signal(8, 8, MuxRole::Multiplexed(2), 3),
                ],
            ),
        ];
        let eces = vec![message(
            "SafeStatus",
            0x200,
            vec![
                signal(48, 8, MuxRole::Plain, 4),
                signal(56, 8, MuxRole::Plain, 5),
                signal(0, 8, MuxRole::Plain, 6),
            ],
        )];
        let ecos = vec![message("SafeCmd", 0x300, vec![signal(0, 8, MuxRole::Plain, 6)])];

        let protocol = |kind, tx| ComProtocol {
            kind,
            datapool_index: 0,
            interfaces: vec![InterfaceMessages { tx, rx: vec![] }],
        };

        NetworkDescription {
            buses: vec![Bus {
                id: 0,
                name: "CAN1".to_string(),
                bus_type: BusType::Can,
            }],
            nodes: vec![Node {
                name: "ECU1".to_string(),
                device_type: "ESX3CM".to_string(),
                flashloader: FlashloaderFamily::Diagnostic,
                interfaces: vec![ComInterface {
                    interface_number: 0,
                    node_id: 1,
                    bus_index: Some(0),
                    connected: true,
                    routing_enabled: false,
                    update_enabled: true,
                }],
                datapools: vec![Datapool {
                    name: "COM".to_string(),
                    lists: vec![DatapoolList {
                        name: "Signals".to_string(),
                        elements,
                    }],
                }],
                protocols: vec![
                    protocol(ProtocolKind::Layer2, layer2),
                    protocol(ProtocolKind::Eces, eces),
                    protocol(ProtocolKind::Ecos, ecos),
                ],
            }],
        }
    }

    fn interpreter() -> FrameInterpreter {
        let interpreter = FrameInterpreter::new();
        interpreter
            .add_database("system.json", Arc::new(description()), 0)
            .unwrap();
        interpreter.start();
        interpreter
    }

    fn names(frame: &InterpretedFrame) -> Vec<&str> {
        frame.signals.iter().map(|s| s.name.as_str()).collect()
    }

    fn eces_payload(counter: u8) -> [u8; 8] {
        let mut data = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0, 0];
        data[6] = counter;
        data[7] = crc8(&data[..6]);
        data
    }

    #[test]
    fn test_decode_with_multiplexer() {
        let interpreter = interpreter();
        let out = interpreter
            .handle_frame(CanFrame::new(0x100, false, &[2, 7, 50, 0, 0, 0, 0, 0]))
            .unwrap();

        assert_eq!(out.message_name, "Status");
        assert!(!out.dlc_error);
        // Sorted by start bit; only the group selected by Mode = 2
        assert_eq!(names(&out), vec!["Mode", "Pressure", "Speed"]);
        assert_eq!(out.signals[1].value, "7");
        assert_eq!(out.signals[2].unit, "km/h");
    }

    #[test]
    fn test_short_frame_flags_dlc_error() {
        let interpreter = interpreter();
        let out = interpreter
            .handle_frame(CanFrame::new(0x100, false, &[1, 9]))
            .unwrap();
        assert!(out.dlc_error);
        let speed = out.signals.iter().find(|s| s.name == "Speed").unwrap();
        assert_eq!(speed.value, "N/A");
        assert!(speed.dlc_error);
        assert_eq!(names(&out), vec!["Mode", "Temp", "Speed"]);
    }

    #[test]
    fn test_eces_status() {
        let interpreter = interpreter();
        let first = interpreter
            .handle_frame(CanFrame::new(0x200, false, &eces_payload(254)))
            .unwrap();
        assert_eq!(first.status, "CRC OK");

        let wrapped = interpreter
            .handle_frame(CanFrame::new(0x200, false, &eces_payload(255)))
            .unwrap();
        assert_eq!(wrapped.status, "CRC OK");

        let rolled = interpreter
            .handle_frame(CanFrame::new(0x200, false, &eces_payload(0)))
            .unwrap();
        assert_eq!(rolled.status, "CRC OK");

        let mut bad = eces_payload(5);
        bad[7] ^= 0xFF;
        let out = interpreter
            .handle_frame(CanFrame::new(0x200, false, &bad))
            .unwrap();
        assert!(out.status.starts_with("Counter Invalid"));
        assert!(out.status.ends_with("CRC Invalid"));
    }

    #[test]
    fn test_ecos_inverted_duplicate() {
        let interpreter = interpreter();
        interpreter.handle_frame(CanFrame::new(0x300, false, &[0x0F, 0x01]));

        let ok = interpreter
            .handle_frame(CanFrame::new(0x301, false, &[0xF0, 0xFE]))
            .unwrap();
        assert!(!ok.is_resolved());
        assert_eq!(ok.status, STATUS_INVERTED_OK);

        let bad = interpreter
            .handle_frame(CanFrame::new(0x301, false, &[0xF0, 0xFF]))
            .unwrap();
        assert_eq!(bad.status, STATUS_INVERTED_INVALID);

        interpreter.stop();
        let after_stop = interpreter
            .handle_frame(CanFrame::new(0x301, false, &[0xF0, 0xFE]))
            .unwrap();
        assert!(after_stop.status.is_empty());
    }

    #[test]
    fn test_protocol_fallback() {
        let interpreter = interpreter();
        interpreter.set_protocol(RawProtocol::CanOpen);
        let out = interpreter
            .handle_frame(CanFrame::new(0x18A, false, &[1, 2]))
            .unwrap();
        assert_eq!(out.protocol_text_hex, "TPDO1 Node 0x0A");
        assert_eq!(out.protocol_text_dec, "TPDO1 Node 10");
        assert!(out.message_name.is_empty());
    }

    #[test]
    fn test_filter_rejections_counted() {
        let interpreter = interpreter();
        interpreter.add_filter(FilterRule::block(0x100, 0x1FF));
        interpreter.add_filter(FilterRule::pass(0x200, 0x2FF));

        assert!(interpreter.handle_frame(CanFrame::new(0x150, false, &[])).is_none());
        assert!(interpreter.handle_frame(CanFrame::new(0x250, false, &[])).is_some());
        assert!(interpreter.handle_frame(CanFrame::new(0x300, false, &[])).is_none());
        assert_eq!(interpreter.filtered_count(), 2);

        interpreter.remove_all_filters();
        assert!(interpreter.handle_frame(CanFrame::new(0x150, false, &[])).is_some());
    }

    #[test]
    fn test_filtered_count_saturates() {
        let interpreter = interpreter();
        interpreter.counters.lock().filtered = u32::MAX;
        interpreter.add_filter(FilterRule::block(0, 0x7FF));
        interpreter.handle_frame(CanFrame::new(0x10, false, &[]));
        assert_eq!(interpreter.filtered_count(), u32::MAX);
    }

    #[test]
    fn test_counters_and_timestamps() {
        let interpreter = interpreter();
        let a = interpreter
            .handle_frame(CanFrame::new(0x7FF, false, &[]).with_timestamp(1_000))
            .unwrap();
        let b = interpreter
            .handle_frame(CanFrame::new(0x7FF, false, &[]).with_timestamp(3_500))
            .unwrap();
        let c = interpreter
            .handle_frame(CanFrame::new(0x7FF, true, &[]).with_timestamp(4_000))
            .unwrap();

        assert_eq!((a.counter, b.counter, c.counter), (1, 2, 1));
        assert_eq!((a.absolute_us, b.absolute_us, c.absolute_us), (0, 2_500, 3_000));
        assert_eq!((a.relative_us, b.relative_us, c.relative_us), (0, 2_500, 500));
        assert_eq!(interpreter.frame_count(0x7FF, false), 2);
        assert_eq!(interpreter.frame_count(0x7FF, true), 1);

        interpreter.stop();
        assert_eq!(interpreter.frame_count(0x7FF, false), 0);
        assert!(!interpreter.is_running());
    }

    #[test]
    fn test_inactive_database_not_used() {
        let interpreter = interpreter();
        interpreter.set_database_active("system.json", false).unwrap();
        let out = interpreter
            .handle_frame(CanFrame::new(0x100, false, &[0; 8]))
            .unwrap();
        assert!(out.message_name.is_empty());

        assert!(interpreter.remove_database("system.json"));
        assert_eq!(interpreter.database_count(), 0);
    }

    #[test]
    fn test_remove_all_log_files_twice() {
        let dir = tempfile::tempdir().unwrap();
        let interpreter = interpreter();
        interpreter.add_log_file(dir.path().join("a.asc"), None).unwrap();
        interpreter.add_log_file(dir.path().join("b.blf"), None).unwrap();
        assert_eq!(interpreter.log_file_count(), 2);

        interpreter.remove_all_log_files();
        assert_eq!(interpreter.log_file_count(), 0);
        interpreter.remove_all_log_files();
        assert_eq!(interpreter.log_file_count(), 0);
    }

    #[test]
    fn test_frames_reach_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let interpreter = interpreter();
        let path = interpreter
            .add_log_file(dir.path().join("trace"), Some(TraceFormat::Asc))
            .unwrap();

        let mut data = [0u8; 8];
        encode_raw(&mut data, BitLayout::intel(16, 8), 88);
        interpreter.handle_frame(CanFrame::new(0x100, false, &data));
        assert!(interpreter.remove_log_file(&path));
        assert!(!interpreter.remove_log_file(&path));

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("//   Message: Status"));
        assert!(text.contains("//     Speed = 88 km/h"));
        assert!(text.ends_with("End TriggerBlock\n"));
    }

    #[test]
    fn test_metadata() {
        let interpreter = FrameInterpreter::new();
        interpreter.set_bus_load(120);
        interpreter.set_tx_count(7);
        interpreter.set_tx_errors(1);
        assert_eq!(
            interpreter.bus_metadata(),
            BusMetadata {
                bus_load_percent: 100,
                tx_count: 7,
                tx_errors: 1
            }
        );
    }

    #[test]
    fn test_take_received_drains() {
        let interpreter = interpreter();
        interpreter.handle_frame(CanFrame::new(0x1, false, &[]));
        interpreter.handle_frame(CanFrame::new(0x2, false, &[]));
        assert_eq!(interpreter.take_received().len(), 2);
        assert!(interpreter.take_received().is_empty());
    }

    #[tokio::test]
    async fn test_attach_pumps_broadcast_stream() {
        let interpreter = Arc::new(interpreter());
        let (tx, rx) = broadcast::channel(16);
        let handle = interpreter.attach(rx);

        tx.send(CanFrame::new(0x100, false, &[0; 8])).unwrap();
        tx.send(CanFrame::new(0x101, false, &[0; 8])).unwrap();
        drop(tx);
        handle.await.unwrap();

        let frames = interpreter.take_received();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].message_name, "Status");
    }
}
