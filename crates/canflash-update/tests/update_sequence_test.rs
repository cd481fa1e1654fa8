//! End-to-end tests of the update sequence against a simulated network
//!
//! Topology used by every test:
//!
//! ```text
//! bus 0 (observed): Gateway (router), Pump (legacy), Display (update disabled)
//! bus 1:            Gateway, Body
//! bus 2:            Isolated (no router reaches it)
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use canflash_core::{CollectingSink, NetworkDescription, NodeAddress, ProgressStep, ResultCode};
use canflash_update::uds::session_type;
use canflash_update::{
    ConnectionStatus, FirmwareImageBuilder, MockNetwork, MockNode, NodeUpdate, Phase,
    SecurityConfig, SequenceRunner, StateChange, UpdateConfig, UpdateError, UpdateFile, UpdateOrchestrator,
    UpdateStatus,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

const TOPOLOGY: &str = r#"
[[buses]]
id = 0
name = "CAN1"

[[buses]]
id = 1
name = "CAN2"

[[buses]]
id = 2
name = "CAN3"

[[nodes]]
name = "Gateway"
device_type = "GW-100"
flashloader = "diagnostic"

[[nodes.interfaces]]
node_id = 1
bus_index = 0
routing_enabled = true

[[nodes.interfaces]]
interface_number = 1
node_id = 1
bus_index = 1
routing_enabled = true

[[nodes]]
name = "Body"
device_type = "BODY-200"
flashloader = "diagnostic"

[[nodes.interfaces]]
node_id = 2
bus_index = 1

[[nodes]]
name = "Isolated"
flashloader = "diagnostic"

[[nodes.interfaces]]
node_id = 3
bus_index = 2

[[nodes]]
name = "Pump"
device_type = "PUMP-10"
flashloader = "legacy"

[[nodes.interfaces]]
node_id = 5
bus_index = 0

[[nodes]]
name = "Display"
flashloader = "diagnostic"

[[nodes.interfaces]]
node_id = 6
bus_index = 0
update_enabled = false
"#;

const GATEWAY: usize = 0;
const BODY: usize = 1;
const ISOLATED: usize = 2;
const PUMP: usize = 3;
const DISPLAY: usize = 4;

const BODY_ADDRESS: NodeAddress = NodeAddress {
    bus_id: 1,
    node_id: 2,
};

/// Options for configuring the test harness
#[derive(Default)]
struct HarnessOptions {
    gateway_secret: Option<Vec<u8>>,
    security: Option<SecurityConfig>,
    /// Application already on Body
    body_application: Option<(&'static str, &'static str)>,
}

struct Harness {
    network: MockNetwork,
    gateway: Arc<MockNode>,
    body: Arc<MockNode>,
    pump: Arc<MockNode>,
    progress: Arc<CollectingSink>,
    orchestrator: Arc<UpdateOrchestrator>,
    dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        Self::with_options(HarnessOptions::default())
    }

    fn with_options(options: HarnessOptions) -> Self {
        let description: NetworkDescription = toml::from_str(TOPOLOGY).unwrap();

        let network = MockNetwork::new(0);
        let mut gateway = MockNode::diagnostic("Gateway", "GW-100").on(0, 1).on(1, 1).router();
        if let Some(secret) = &options.gateway_secret {
            gateway = gateway.with_secret(secret);
        }
        let mut body = MockNode::diagnostic("Body", "BODY-200").on(1, 2);
        if let Some((name, version)) = options.body_application {
            body = body.with_application(name, version);
        }
        let gateway = network.add_node(gateway);
        let body = network.add_node(body);
        let pump = network.add_node(MockNode::legacy("Pump", "PUMP-10").on(0, 5));

        let mut config = UpdateConfig::default();
        config.timeouts.flashloader_reset_wait_ms = 1;
        config.timeouts.reset_settle_ms = 1;
        config.security = options.security;

        let progress = Arc::new(CollectingSink::new());
        let orchestrator = UpdateOrchestrator::new(
            Arc::new(description),
            0,
            Arc::new(network.clone()),
            config,
        )
        .unwrap()
        .with_progress(progress.clone());

        Self {
            network,
            gateway,
            body,
            pump,
            progress,
            orchestrator: Arc::new(orchestrator),
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn write_file(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn firmware(&self, name: &str, device: &str, application: &str, areas: &[(u32, Vec<u8>)]) -> UpdateFile {
        let mut builder = FirmwareImageBuilder::new(device).application(application, "1.0");
        for (address, data) in areas {
            builder = builder.area(*address, data.clone());
        }
        UpdateFile::Firmware {
            path: self.write_file(name, &builder.build()),
        }
    }

    async fn prepare(&self, package: Vec<NodeUpdate>) {
        self.orchestrator.set_package(package).unwrap();
        self.orchestrator.activate_flashloader().await.unwrap();
        self.orchestrator.read_device_info().await.unwrap();
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
}

fn entry(node: &str, files: Vec<UpdateFile>) -> NodeUpdate {
    NodeUpdate {
        node: node.to_string(),
        files,
    }
}

// =============================================================================
// Activation and device information
// =============================================================================

#[tokio::test]
async fn test_activation_routes_and_opens_sessions() {
    let h = Harness::new();
    h.orchestrator.activate_flashloader().await.unwrap();

    assert!(h.gateway.is_in_flashloader());
    assert_eq!(h.gateway.session(), session_type::PROGRAMMING);
    assert!(h.gateway.routes_to(1));
    assert!(h.body.is_in_flashloader());
    assert_eq!(h.body.session(), session_type::PROGRAMMING);
    assert!(h.pump.is_in_flashloader());

    let states = h.orchestrator.node_states();
    assert_eq!(states[ISOLATED].connection, ConnectionStatus::Error);
    assert!(states[ISOLATED].last_error.is_some());
    assert_eq!(states[DISPLAY].connection, ConnectionStatus::UpdateDisabled);
    assert_eq!(states[DISPLAY].update, UpdateStatus::Disabled);
    assert_eq!(states[BODY].connection, ConnectionStatus::Unknown);

    let events = h.progress.events();
    assert!(events.iter().any(|e| e.step == ProgressStep::RoutingSetup
        && e.node == Some(NodeAddress { bus_id: 0, node_id: 1 })));
    let last = events.last().unwrap();
    assert_eq!(last.step, ProgressStep::ActivateFlashloaderFinished);
    assert_eq!(last.result, ResultCode::Ok);
}

#[tokio::test]
async fn test_read_device_info_evaluates_nodes() {
    let h = Harness::new();
    let firmware = h.firmware("gw.bin", "GW-100", "gw_app", &[(0x1000, pattern(64, 1))]);
    h.prepare(vec![entry("Gateway", vec![firmware])]).await;

    let states = h.orchestrator.node_states();
    assert_eq!(states[GATEWAY].connection, ConnectionStatus::ToBeUpdated);
    assert_eq!(states[GATEWAY].update, UpdateStatus::Waiting);
    assert_eq!(states[BODY].connection, ConnectionStatus::ApplicationMatch);
    assert_eq!(states[BODY].update, UpdateStatus::UpToDate);
    assert_eq!(
        states[BODY].device_info.as_ref().map(|i| i.device_name().to_string()),
        Some("BODY-200".to_string())
    );
    assert_eq!(states[PUMP].connection, ConnectionStatus::ApplicationMatch);
    assert_eq!(states[ISOLATED].connection, ConnectionStatus::Error);

    let infos = h.orchestrator.take_device_infos();
    let diagnostic: Vec<usize> = infos.diagnostic.iter().map(|(i, _)| *i).collect();
    assert_eq!(diagnostic, vec![GATEWAY, BODY]);
    assert_eq!(infos.diagnostic[0].1.max_block_length, 256);
    assert_eq!(infos.legacy.len(), 1);
    assert_eq!(infos.legacy[0].0, PUMP);
    assert_eq!(infos.legacy[0].1.device_name, "PUMP-10");

    assert!(h.orchestrator.take_device_infos().is_empty());
}

#[tokio::test]
async fn test_matching_application_is_skipped() {
    let h = Harness::with_options(HarnessOptions {
        body_application: Some(("body_app", "1.0")),
        ..Default::default()
    });
    let firmware = h.firmware("body.bin", "BODY-200", "body_app", &[(0x2000, pattern(32, 3))]);
    h.prepare(vec![entry("Body", vec![firmware])]).await;

    let state = h.orchestrator.node_state(BODY).unwrap();
    assert_eq!(state.connection, ConnectionStatus::ApplicationMatch);
    assert!(state.skip_files.contains(&0));

    h.orchestrator.update(&[BODY]).await.unwrap();
    assert!(!h.body.requests().iter().any(|r| r.first() == Some(&0x34)));
    assert_eq!(h.orchestrator.node_state(BODY).unwrap().update, UpdateStatus::Success);
}

#[tokio::test]
async fn test_security_access_unlocks_node() {
    let h = Harness::with_options(HarnessOptions {
        gateway_secret: Some(vec![0xA5, 0x5A]),
        security: Some(SecurityConfig {
            level: 1,
            secret: "a55a".to_string(),
        }),
        ..Default::default()
    });
    h.orchestrator.activate_flashloader().await.unwrap();

    assert!(h.gateway.is_unlocked());
    assert_ne!(
        h.orchestrator.node_state(GATEWAY).unwrap().connection,
        ConnectionStatus::Error
    );
}

#[tokio::test]
async fn test_wrong_secret_marks_node_failed() {
    let h = Harness::with_options(HarnessOptions {
        gateway_secret: Some(vec![0xA5, 0x5A]),
        security: Some(SecurityConfig {
            level: 1,
            secret: "0000".to_string(),
        }),
        ..Default::default()
    });
    // Per-node failures do not fail the phase
    h.orchestrator.activate_flashloader().await.unwrap();

    assert!(!h.gateway.is_unlocked());
    let states = h.orchestrator.node_states();
    assert_eq!(states[GATEWAY].connection, ConnectionStatus::Error);
    assert!(h.body.is_in_flashloader());
}

// =============================================================================
// Update
// =============================================================================

#[tokio::test]
async fn test_full_update_writes_all_files() {
    let h = Harness::new();
    let gw_image = pattern(600, 1);
    let body_image = pattern(300, 2);
    let pump_image = pattern(700, 3);
    let parameters = pattern(100, 4);

    let package = vec![
        entry(
            "Gateway",
            vec![
                h.firmware("gw.bin", "GW-100", "gw_app", &[(0x1000, gw_image.clone())]),
                UpdateFile::ParameterSet {
                    path: h.write_file("gw.psi", &parameters),
                },
                UpdateFile::Pem {
                    path: h.write_file(
                        "gw.pem",
                        b"-----BEGIN PUBLIC KEY-----\nAQIDBA==\n-----END PUBLIC KEY-----\n",
                    ),
                },
                UpdateFile::SecurityState {
                    security: StateChange::Activate,
                    debugger: StateChange::NoChange,
                },
            ],
        ),
        entry(
            "Body",
            vec![h.firmware("body.bin", "BODY-200", "body_app", &[(0x2000, body_image.clone())])],
        ),
        entry(
            "Pump",
            vec![h.firmware("pump.bin", "PUMP-10", "pump_app", &[(0x4000, pump_image.clone())])],
        ),
    ];
    h.prepare(package).await;
    h.orchestrator.update(&[GATEWAY, BODY, PUMP]).await.unwrap();

    assert_eq!(h.gateway.memory(0x1000), Some(gw_image));
    assert_eq!(h.gateway.parameter_set(), Some(parameters));
    assert_eq!(h.gateway.certificate(), Some(vec![1, 2, 3, 4]));
    assert_eq!(h.gateway.security_state(), Some(1));
    assert_eq!(h.gateway.debugger_state(), None);
    assert_eq!(h.body.memory(0x2000), Some(body_image));
    assert_eq!(h.pump.memory(0x4000), Some(pump_image));

    let states = h.orchestrator.node_states();
    for node in [GATEWAY, BODY, PUMP] {
        assert_eq!(states[node].update, UpdateStatus::Success);
    }

    let events = h.progress.events();
    let body_transfer = events
        .iter()
        .filter(|e| e.step == ProgressStep::FirmwareTransfer && e.node == Some(BODY_ADDRESS))
        .last()
        .unwrap();
    assert_eq!(body_transfer.percent, Some(100));
    assert_eq!(events.last().unwrap().step, ProgressStep::UpdateFinished);
}

#[tokio::test]
async fn test_device_name_mismatch_reports_position() {
    let h = Harness::new();
    let package = vec![
        entry(
            "Gateway",
            vec![h.firmware("gw.bin", "GW-100", "gw_app", &[(0x1000, pattern(16, 1))])],
        ),
        entry(
            "Body",
            vec![h.firmware("other.bin", "WRONG-1", "other_app", &[(0x2000, pattern(16, 2))])],
        ),
    ];
    h.prepare(package).await;

    let err = h.orchestrator.update(&[GATEWAY, BODY]).await.unwrap_err();
    assert_eq!(err.failure_position(), Some((1, 0)));
    assert_eq!(
        err.root(),
        &UpdateError::DeviceNameMismatch {
            expected: "WRONG-1".to_string(),
            actual: "BODY-200".to_string(),
        }
    );

    let states = h.orchestrator.node_states();
    assert_eq!(states[GATEWAY].update, UpdateStatus::Success);
    assert_ne!(states[BODY].update, UpdateStatus::Success);
    assert!(states[BODY].last_error.is_some());
    assert_eq!(h.body.memory(0x2000), None);

    let last = h.progress.events().pop().unwrap();
    assert_eq!(last.step, ProgressStep::UpdateFinished);
    assert_eq!(last.result, ResultCode::ProtocolMismatch);
}

#[tokio::test]
async fn test_device_name_mismatch_on_first_node() {
    let h = Harness::new();
    let package = vec![entry(
        "Gateway",
        vec![
            h.firmware("gw.bin", "BODY-200", "gw_app", &[(0x1000, pattern(16, 1))]),
            UpdateFile::ParameterSet {
                path: h.write_file("gw.psi", &[1, 2, 3]),
            },
        ],
    )];
    h.prepare(package).await;

    let err = h.orchestrator.update(&[GATEWAY, BODY]).await.unwrap_err();
    assert_eq!(err.failure_position(), Some((0, 0)));
    assert!(matches!(err.root(), UpdateError::DeviceNameMismatch { .. }));
    // Later files and nodes are not touched
    assert_eq!(h.gateway.parameter_set(), None);
    assert!(!h.body.requests().iter().any(|r| r.first() == Some(&0x34)));
}

#[tokio::test]
async fn test_legacy_node_rejects_parameter_set() {
    let h = Harness::new();
    let package = vec![entry(
        "Pump",
        vec![UpdateFile::ParameterSet {
            path: h.write_file("pump.psi", &[1, 2, 3]),
        }],
    )];
    h.prepare(package).await;

    let err = h.orchestrator.update(&[PUMP]).await.unwrap_err();
    assert_eq!(err.failure_position(), Some((0, 0)));
    assert!(matches!(err.root(), UpdateError::Config(_)));
}

#[tokio::test]
async fn test_oversized_parameter_set_is_rejected() {
    let h = Harness::new();
    let package = vec![entry(
        "Gateway",
        vec![UpdateFile::ParameterSet {
            path: h.write_file("big.psi", &pattern(300, 0)),
        }],
    )];
    h.prepare(package).await;

    let err = h.orchestrator.update(&[GATEWAY]).await.unwrap_err();
    assert!(matches!(err.root(), UpdateError::MemoryRange(_)));
    assert_eq!(h.gateway.parameter_set(), None);
}

#[tokio::test]
async fn test_invalid_arguments() {
    let h = Harness::new();
    let err = h
        .orchestrator
        .set_package(vec![entry("Nobody", vec![])])
        .unwrap_err();
    assert!(matches!(err, UpdateError::Config(_)));

    let err = h.orchestrator.update(&[99]).await.unwrap_err();
    assert!(matches!(err, UpdateError::Config(_)));
}

// =============================================================================
// Reset
// =============================================================================

#[tokio::test]
async fn test_reset_system_returns_to_application() {
    let h = Harness::new();
    h.orchestrator.activate_flashloader().await.unwrap();
    let body_resets = h.body.reset_count();

    h.orchestrator.reset_system().await.unwrap();

    assert!(!h.gateway.is_in_flashloader());
    assert!(!h.body.is_in_flashloader());
    assert!(!h.pump.is_in_flashloader());
    assert_eq!(h.body.reset_count(), body_resets + 1);
    assert_eq!(h.gateway.session(), session_type::DEFAULT);

    // Routed nodes are reset before the broadcast takes their router down
    let events = h.progress.events();
    let node_reset = events
        .iter()
        .position(|e| e.step == ProgressStep::ResetNode && e.node == Some(BODY_ADDRESS))
        .unwrap();
    let broadcast = events
        .iter()
        .position(|e| e.step == ProgressStep::ResetBroadcast)
        .unwrap();
    assert!(node_reset < broadcast);
}

// =============================================================================
// Background runner
// =============================================================================

#[tokio::test]
async fn test_runner_busy_and_abort() {
    let h = Harness::new();
    let package = vec![entry(
        "Gateway",
        vec![h.firmware("gw.bin", "GW-100", "gw_app", &[(0x1000, pattern(2048, 5))])],
    )];
    h.prepare(package).await;

    h.network.set_latency(Duration::from_millis(20));
    let runner = SequenceRunner::new(Arc::clone(&h.orchestrator));
    runner.start_update(vec![GATEWAY]).unwrap();

    assert!(runner.is_running());
    assert_eq!(runner.start_reset(), Err(UpdateError::Busy));
    assert_eq!(runner.result(), Err(UpdateError::Busy));

    tokio::time::sleep(Duration::from_millis(60)).await;
    runner.abort();
    assert_eq!(runner.join().await, Err(UpdateError::Aborted));

    assert!(!runner.is_running());
    assert_eq!(runner.result(), Err(UpdateError::Aborted));
    assert_ne!(
        h.orchestrator.node_state(GATEWAY).unwrap().update,
        UpdateStatus::Success
    );
    assert_eq!(h.progress.events().last().unwrap().step, ProgressStep::Aborted);

    // Idle again after the abort
    h.network.set_latency(Duration::ZERO);
    runner.start_reset().unwrap();
    runner.join().await.unwrap();
    assert!(!h.gateway.is_in_flashloader());
}

#[tokio::test]
async fn test_abort_right_after_start() {
    let h = Harness::new();
    let package = vec![entry(
        "Gateway",
        vec![h.firmware("gw.bin", "GW-100", "gw_app", &[(0x1000, pattern(2048, 5))])],
    )];
    h.prepare(package).await;

    let runner = SequenceRunner::new(Arc::clone(&h.orchestrator));
    runner.start_update(vec![GATEWAY]).unwrap();
    runner.abort();

    assert_eq!(runner.join().await, Err(UpdateError::Aborted));
    assert!(h.gateway.memory(0x1000).is_none());
    assert_eq!(h.progress.events().last().unwrap().step, ProgressStep::Aborted);

    // The abort does not carry over into the next sequence
    runner.start_reset().unwrap();
    assert_eq!(runner.join().await, Ok(()));
}

#[tokio::test]
async fn test_runner_stays_busy_while_joined() {
    let h = Harness::new();
    let package = vec![entry(
        "Gateway",
        vec![h.firmware("gw.bin", "GW-100", "gw_app", &[(0x1000, pattern(2048, 5))])],
    )];
    h.prepare(package).await;

    h.network.set_latency(Duration::from_millis(20));
    let runner = Arc::new(SequenceRunner::new(Arc::clone(&h.orchestrator)));
    runner.start_update(vec![GATEWAY]).unwrap();

    let joiner = {
        let runner = Arc::clone(&runner);
        tokio::spawn(async move { runner.join().await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(h.orchestrator.phase(), Phase::Updating);
    assert!(runner.is_running());
    assert_eq!(runner.result(), Err(UpdateError::Busy));
    assert_eq!(runner.start_reset(), Err(UpdateError::Busy));

    h.network.set_latency(Duration::ZERO);
    assert_eq!(joiner.await.unwrap(), Ok(()));
    assert!(!runner.is_running());
    assert_eq!(runner.result(), Ok(()));
    assert_eq!(
        h.orchestrator.node_state(GATEWAY).unwrap().update,
        UpdateStatus::Success
    );
}

#[tokio::test]
async fn test_runner_collects_device_infos() {
    let h = Harness::new();
    let runner = SequenceRunner::new(Arc::clone(&h.orchestrator));

    runner.start_activate_flashloader().unwrap();
    runner.join().await.unwrap();
    runner.start_read_device_info().unwrap();
    runner.join().await.unwrap();

    let infos = runner.take_device_infos();
    assert_eq!(infos.len(), 3);
}
