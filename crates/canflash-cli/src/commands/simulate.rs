//! Simulate-update command - run the full update sequence on a mock network

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use canflash_core::{ChannelSink, FlashloaderFamily, NetworkDescription};
use canflash_trace::FrameInterpreter;
use canflash_update::{
    ConnectionStatus, ConnectionTransport, MockNetwork, MockNode, Sequence, SequenceRunner,
    UpdateNodeState, UpdateOrchestrator,
};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::config::Config;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Simulated network mirroring the topology
///
/// Every node with a flashloader is simulated on each connected interface;
/// nodes routing between two or more interfaces act as routers. With
/// security configured, every node requires the configured secret.
pub fn build_network(
    description: &NetworkDescription,
    bus_index: usize,
    secret: Option<&[u8]>,
) -> Result<MockNetwork> {
    let local_bus = description
        .buses
        .get(bus_index)
        .with_context(|| format!("Bus index {} out of range", bus_index))?
        .id;
    let network = MockNetwork::new(local_bus);

    for node in &description.nodes {
        let device_name = if node.device_type.is_empty() {
            &node.name
        } else {
            &node.device_type
        };
        let mut mock = match node.flashloader {
            FlashloaderFamily::None => continue,
            FlashloaderFamily::Legacy => MockNode::legacy(&node.name, device_name),
            FlashloaderFamily::Diagnostic => MockNode::diagnostic(&node.name, device_name),
        };
        for iface in node.interfaces.iter().filter(|i| i.connected) {
            if let Some(bus) = iface.bus_index.and_then(|b| description.buses.get(b)) {
                mock = mock.on(bus.id, iface.node_id);
            }
        }
        let routing = node
            .interfaces
            .iter()
            .filter(|i| i.connected && i.routing_enabled)
            .count();
        if routing >= 2 {
            mock = mock.router();
        }
        if let Some(secret) = secret {
            mock = mock.with_secret(secret);
        }
        network.add_node(mock);
    }
    Ok(network)
}

fn progress_bar() -> Result<ProgressBar> {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}% {msg}")?
            .progress_chars("=>-"),
    );
    Ok(pb)
}

/// Run one sequence to its end; Ctrl-C aborts it
async fn run(runner: &SequenceRunner, sequence: Sequence) -> Result<()> {
    runner.start(sequence.clone())?;
    while runner.is_running() {
        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, aborting");
                runner.abort();
            }
        }
    }
    runner
        .join()
        .await
        .with_context(|| format!("{:?} failed", sequence))
}

/// Activate, read, update and reset every node of the topology
///
/// Returns the final state of every node.
pub async fn simulate_update(config: &Config, topology: &Path) -> Result<Vec<UpdateNodeState>> {
    let description = Arc::new(
        NetworkDescription::load(topology)
            .with_context(|| format!("Invalid topology: {}", topology.display()))?,
    );
    let secret = config
        .update
        .security
        .as_ref()
        .map(|s| hex::decode(&s.secret))
        .transpose()
        .context("Invalid security secret")?;
    let network = build_network(&description, config.bus_index, secret.as_deref())?;

    // Trace the simulated traffic into the configured files
    let interpreter = Arc::new(FrameInterpreter::from_config(&config.interpreter));
    interpreter.add_database(
        topology.display().to_string(),
        Arc::clone(&description),
        config.bus_index,
    )?;
    for path in &config.log_files {
        interpreter
            .add_log_file(path, None)
            .with_context(|| format!("Failed to open trace file: {}", path.display()))?;
    }
    interpreter.start();
    let tracer = interpreter.attach(network.subscribe_frames());

    let (sink, mut events) = ChannelSink::new();
    let pb = progress_bar()?;
    let bar = pb.clone();
    let progress = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Some(percent) = event.percent {
                bar.set_position(percent as u64);
            }
            let node = event.node.map(|n| format!("[{}] ", n)).unwrap_or_default();
            bar.set_message(format!("{}{}", node, event.text));
            if !event.result.is_ok() {
                bar.println(format!("{:?}: {}{}", event.result, node, event.text));
            }
        }
    });

    let orchestrator = UpdateOrchestrator::new(
        Arc::clone(&description),
        config.bus_index,
        Arc::new(network.clone()),
        config.update.clone(),
    )?
    .with_progress(Arc::new(sink));
    orchestrator.set_package(config.package.clone())?;
    let runner = SequenceRunner::new(Arc::new(orchestrator));

    let outcome = async {
        run(&runner, Sequence::ActivateFlashloader).await?;
        run(&runner, Sequence::ReadDeviceInfo).await?;

        let states = runner.orchestrator().node_states();
        let order: Vec<usize> = config
            .package
            .iter()
            .filter_map(|entry| description.node_index_by_name(&entry.node))
            .filter(|i| states[*i].connection == ConnectionStatus::ToBeUpdated)
            .collect();
        if order.is_empty() {
            info!("All nodes up to date");
        } else {
            run(&runner, Sequence::Update(order)).await?;
        }
        run(&runner, Sequence::ResetSystem).await
    }
    .await;

    let states = runner.orchestrator().node_states();
    drop(runner);
    // The sink went away with the orchestrator, so the progress task ends
    progress.await.context("Progress task failed")?;
    pb.finish_and_clear();

    interpreter.stop();
    interpreter.remove_all_log_files();
    tracer.abort();

    for (node, state) in description.nodes.iter().zip(&states) {
        println!(
            "{:<16} {:<18} {:<10} {}",
            node.name,
            format!("{:?}", state.connection),
            format!("{:?}", state.update),
            state.last_error.as_deref().unwrap_or("")
        );
    }
    outcome.map(|()| states)
}

#[cfg(test)]
mod tests {
    use super::*;
    use canflash_update::{FirmwareImageBuilder, NodeUpdate, UpdateFile, UpdateStatus};

    const TOPOLOGY: &str = r#"
[[buses]]
id = 0
name = "CAN1"

[[buses]]
id = 1
name = "CAN2"

[[nodes]]
name = "Gateway"
device_type = "GW-100"
flashloader = "diagnostic"
interfaces = [
    { node_id = 1, bus_index = 0, routing_enabled = true },
    { interface_number = 1, node_id = 1, bus_index = 1, routing_enabled = true },
]

[[nodes]]
name = "Body"
device_type = "BODY-200"
flashloader = "diagnostic"
interfaces = [{ node_id = 2, bus_index = 1 }]

[[nodes]]
name = "Lamp"
interfaces = [{ node_id = 3, bus_index = 0 }]
"#;

    #[test]
    fn test_build_network() {
        let description: NetworkDescription = toml::from_str(TOPOLOGY).unwrap();
        let network = build_network(&description, 0, None).unwrap();

        assert_eq!(network.local_bus(), 0);
        assert_eq!(network.node("Gateway").unwrap().addresses().len(), 2);
        assert_eq!(network.node("Body").unwrap().addresses().len(), 1);
        assert!(network.node("Lamp").is_none());
        assert!(build_network(&description, 7, None).is_err());
    }

    #[tokio::test]
    async fn test_simulated_update_writes_firmware() {
        let dir = tempfile::tempdir().unwrap();
        let topology = dir.path().join("system.toml");
        std::fs::write(&topology, TOPOLOGY).unwrap();
        let firmware = dir.path().join("body.bin");
        std::fs::write(
            &firmware,
            FirmwareImageBuilder::new("BODY-200")
                .application("body_app", "2.0")
                .area(0x8000, vec![0x5A; 500])
                .build(),
        )
        .unwrap();

        let mut config = Config::default();
        config.update.timeouts.flashloader_reset_wait_ms = 1;
        config.update.timeouts.reset_settle_ms = 1;
        config.log_files = vec![dir.path().join("update.asc")];
        config.package = vec![NodeUpdate {
            node: "Body".to_string(),
            files: vec![UpdateFile::Firmware { path: firmware }],
        }];

        let states = simulate_update(&config, &topology).await.unwrap();
        assert_eq!(states[1].update, UpdateStatus::Success);
        assert_eq!(states[0].connection, ConnectionStatus::ApplicationMatch);

        let trace = std::fs::read_to_string(dir.path().join("update.asc")).unwrap();
        assert!(trace.lines().count() > 10);
    }
}
