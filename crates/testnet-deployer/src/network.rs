//! The `TestNetwork` orchestrator: generate, run, monitor, teardown.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use color_eyre::eyre::{eyre, Result};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{LaunchConfig, NetworkConfig, NetworkDescriptor, NodeInfo};
use crate::generator;
use crate::keys::KeyGenerator;
use crate::launcher::Launcher;
use crate::monitor::NetworkMonitor;
use crate::process::{PortUse, ProcessControl};
use crate::rpc::RpcClient;
use crate::stream::EventStreamClient;

/// How long `run` waits for the network's ports to free up, killing
/// active holders along the way.
pub const PORT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
const PORT_WAIT_INTERVAL: Duration = Duration::from_secs(2);
/// Upper bound on base-port remap attempts under `find_ports`.
const MAX_PORT_SEARCH: u16 = 50;

pub struct TestNetwork {
    base_dir: PathBuf,
    config: NetworkConfig,
    process: Box<dyn ProcessControl>,
    rpc: RpcClient,
    nodes: Vec<NodeInfo>,
}

impl TestNetwork {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        config: NetworkConfig,
        process: Box<dyn ProcessControl>,
    ) -> Self {
        let rpc = RpcClient::new(config.base_port_rpc);
        Self {
            base_dir: base_dir.into(),
            config,
            process,
            rpc,
            nodes: Vec::new(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    pub fn process(&self) -> &dyn ProcessControl {
        self.process.as_ref()
    }

    /// Populate the node list from the persisted descriptor, if it is
    /// not already in memory. Errors when the network was never
    /// generated.
    pub fn load(&mut self) -> Result<()> {
        if !self.nodes.is_empty() {
            return Ok(());
        }
        let descriptor = NetworkDescriptor::load(&self.base_dir)?;
        self.config = descriptor.network_config();
        self.rpc.set_base_port(self.config.base_port_rpc);
        self.nodes = descriptor.nodes;
        Ok(())
    }

    /// Generate identities and configs for every node and persist the
    /// network descriptor. Wipes whatever a previous generation left in
    /// the base directory first.
    pub fn generate(
        &mut self,
        key_generator: &dyn KeyGenerator,
        log_levels: &[(String, String)],
        find_ports: bool,
    ) -> Result<()> {
        info!(
            nodes = self.config.node_count,
            network_id = self.config.network_id,
            base_dir = %self.base_dir.display(),
            "generating test network"
        );
        self.config.validate()?;
        self.clean()?;

        if find_ports {
            self.find_free_ports()?;
        } else {
            let conflicts = self.active_conflicts();
            if !conflicts.is_empty() {
                let ports = conflicts
                    .iter()
                    .map(|(port, uses)| {
                        let holders = uses
                            .iter()
                            .map(|u| format!("{} (pid {}, {})", u.process, u.pid, u.state))
                            .collect::<Vec<_>>()
                            .join(", ");
                        format!("  {port}: {holders}")
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                return Err(eyre!(
                    "ports already in use:\n{ports}\nhint: run `testnet-deployer teardown`, \
                     stop the processes above, or pass --find-ports"
                ));
            }
        }

        self.nodes = generator::generate_all(
            &self.base_dir,
            &self.config,
            key_generator,
            log_levels,
        )?;
        NetworkDescriptor::new(&self.config, self.nodes.clone()).save(&self.base_dir)?;
        info!(descriptor = %NetworkDescriptor::path(&self.base_dir).display(), "network generated");
        Ok(())
    }

    /// Ports with at least one holder in an active TCP state.
    /// TIME_WAIT holders are ignored; they clear on their own.
    pub fn active_conflicts(&self) -> BTreeMap<u16, Vec<PortUse>> {
        self.process
            .check_ports_free(&self.config.all_ports())
            .into_iter()
            .filter_map(|(port, uses)| {
                let active: Vec<PortUse> =
                    uses.into_iter().filter(|u| u.is_active()).collect();
                if active.is_empty() {
                    None
                } else {
                    Some((port, active))
                }
            })
            .collect()
    }

    /// Shift all three base ports upward in lockstep until every
    /// derived port is free.
    fn find_free_ports(&mut self) -> Result<()> {
        let stride = self.config.node_count as u32;
        let span = (self.config.node_count - 1) as u32;
        let original = self.config.clone();
        let highest_base = original
            .base_port_peer
            .max(original.base_port_rpc)
            .max(original.base_port_ws) as u32;
        for attempt in 0..u32::from(MAX_PORT_SEARCH) {
            let offset = stride * attempt;
            // Stop searching before any derived port would leave the
            // 16-bit port space.
            if highest_base + offset + span > u32::from(u16::MAX) {
                break;
            }
            let offset = offset as u16;
            self.config = NetworkConfig {
                base_port_peer: original.base_port_peer + offset,
                base_port_rpc: original.base_port_rpc + offset,
                base_port_ws: original.base_port_ws + offset,
                ..original.clone()
            };
            if self.active_conflicts().is_empty() {
                if attempt > 0 {
                    info!(
                        base_port_peer = self.config.base_port_peer,
                        base_port_rpc = self.config.base_port_rpc,
                        base_port_ws = self.config.base_port_ws,
                        "remapped base ports to avoid conflicts"
                    );
                }
                self.rpc.set_base_port(self.config.base_port_rpc);
                return Ok(());
            }
        }
        self.config = original;
        Err(eyre!(
            "no free port range found after {MAX_PORT_SEARCH} attempts\nhint: run \
             `testnet-deployer teardown` or free the ports manually"
        ))
    }

    /// Launch every node through the launcher. One node failing to
    /// launch logs an error and continues; the rest of the cluster is
    /// still useful.
    pub fn run(&mut self, launch: &LaunchConfig, launcher: &mut dyn Launcher) -> Result<()> {
        self.load()?;
        check_node_binary(&launch.node_binary)?;
        self.wait_for_ports_free()?;

        info!(
            launcher = launcher.name(),
            nodes = self.nodes.len(),
            binary = %launch.node_binary.display(),
            "launching test network"
        );
        let nodes = self.nodes.clone();
        let mut launched = 0;
        for (i, node) in nodes.iter().enumerate() {
            info!(node_id = node.id, role = node.role(), "launching node");
            if launcher.launch(node, launch) {
                launched += 1;
            } else {
                warn!(node_id = node.id, "node failed to launch, continuing");
            }
            if !launch.launch_delay.is_zero() && i + 1 < nodes.len() {
                std::thread::sleep(launch.launch_delay);
            }
        }
        launcher.finalize();
        info!(
            launched,
            rpc = %format!("http://127.0.0.1:{}", self.config.base_port_rpc),
            ws = %format!("ws://127.0.0.1:{}", self.config.base_port_ws),
            "network started"
        );
        Ok(())
    }

    /// Wait for the network's ports to free up, killing whatever holds
    /// them in an active state. Lingering TIME_WAIT sockets are fine;
    /// the node binary sets SO_REUSEADDR.
    fn wait_for_ports_free(&self) -> Result<()> {
        let deadline = Instant::now() + PORT_WAIT_TIMEOUT;
        let mut killed: HashSet<i32> = HashSet::new();
        loop {
            let conflicts = self.active_conflicts();
            if conflicts.is_empty() {
                return Ok(());
            }
            for (port, holders) in &conflicts {
                for holder in holders {
                    if holder.pid > 0 && killed.insert(holder.pid) {
                        warn!(
                            port,
                            pid = holder.pid,
                            process = %holder.process,
                            "killing process holding network port"
                        );
                        self.process.kill(holder.pid, 9);
                    }
                }
            }
            if Instant::now() >= deadline {
                let ports = conflicts.keys().map(u16::to_string).collect::<Vec<_>>();
                return Err(eyre!(
                    "ports still in use after {PORT_WAIT_TIMEOUT:?}: {}\nhint: stop the \
                     processes holding them and retry",
                    ports.join(", ")
                ));
            }
            std::thread::sleep(PORT_WAIT_INTERVAL);
        }
    }

    /// Watch the running network until the shutdown signal fires.
    pub async fn monitor(
        &mut self,
        tracked_amendment: Option<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        self.load()?;
        let mut monitor = NetworkMonitor::new(
            self.rpc.clone(),
            EventStreamClient::new(self.config.base_port_ws),
            self.config.clone(),
            tracked_amendment,
        );
        monitor.run(shutdown).await
    }

    /// Kill every node process, tear down the multiplexer session, and
    /// remove the generated files. Idempotent: with nothing generated
    /// or running this reports 0 kills and succeeds.
    pub fn teardown(&mut self, launcher: Option<&mut dyn Launcher>) -> Result<usize> {
        if self.nodes.is_empty() {
            match NetworkDescriptor::load(&self.base_dir) {
                Ok(descriptor) => {
                    self.config = descriptor.network_config();
                    self.nodes = descriptor.nodes;
                }
                Err(_) => debug!("no network descriptor, tearing down by directory pattern"),
            }
        }

        // Node processes are found by their unique config-path argument
        // rather than trusting the launcher session to still exist.
        // With no descriptor there is nothing safe to match on: pgrep -f
        // matches substrings, and a bare directory pattern would catch
        // this process's own command line.
        let mut killed: HashSet<i32> = HashSet::new();
        for node in &self.nodes {
            let pattern = node.config_path.display().to_string();
            for pid in self.process.find_by_pattern(&pattern) {
                if killed.insert(pid) && !self.process.kill(pid, 9) {
                    warn!(pid, "failed to kill node process");
                }
            }
        }

        if let Some(launcher) = launcher {
            if launcher.shutdown_session() {
                debug!("multiplexer session removed");
            }
        }

        self.clean()?;
        if killed.is_empty() {
            info!("teardown complete, no node processes were running");
        } else {
            info!(killed = killed.len(), "teardown complete");
        }
        Ok(killed.len())
    }

    /// Remove every generated artifact: node directories, the roster,
    /// and the descriptor.
    pub fn clean(&mut self) -> Result<()> {
        self.nodes.clear();
        if !self.base_dir.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let is_node_dir = name
                .strip_prefix('n')
                .is_some_and(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()));
            if is_node_dir && entry.path().is_dir() {
                std::fs::remove_dir_all(entry.path())?;
            }
        }
        for file in [generator::ROSTER_FILE, crate::config::DESCRIPTOR_FILE] {
            let path = self.base_dir.join(file);
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    pub async fn server_info(&mut self, node_id: usize) -> Result<Option<Value>> {
        self.load()?;
        Ok(self.rpc.server_info(node_id).await)
    }

    pub async fn ping(&mut self, node_id: usize) -> Result<Option<Value>> {
        self.load()?;
        Ok(self.rpc.ping(node_id).await)
    }

    /// Inject a privileged transaction through the primary node.
    pub async fn inject(&mut self, tx_blob: &str) -> Result<Value> {
        self.load()?;
        let primary = self
            .nodes
            .iter()
            .find(|node| node.is_injector)
            .ok_or_else(|| eyre!("network has no primary node"))?;
        Ok(self.rpc.inject(primary.id, tx_blob).await)
    }

    /// Adjust a log partition at runtime, on one node or all of them.
    pub async fn set_log_level(
        &mut self,
        partition: &str,
        severity: &str,
        node: Option<usize>,
    ) -> Result<()> {
        self.load()?;
        let targets: Vec<usize> = match node {
            Some(node_id) => vec![node_id],
            None => self.nodes.iter().map(|n| n.id).collect(),
        };
        for node_id in targets {
            if self.rpc.log_level(node_id, partition, severity).await {
                info!(node_id, partition, severity, "log level updated");
            } else {
                warn!(node_id, partition, severity, "log level update failed");
            }
        }
        Ok(())
    }

    /// Plain-text summary of the generated or loaded network.
    pub fn print_summary(&self) {
        println!(
            "network {} ({} nodes) in {}",
            self.config.network_id,
            self.config.node_count,
            self.base_dir.display()
        );
        println!(
            "{:<5} {:<10} {:>8} {:>8} {:>8}  {}",
            "node", "role", "peer", "rpc", "ws", "public key"
        );
        for node in &self.nodes {
            println!(
                "{:<5} {:<10} {:>8} {:>8} {:>8}  {}",
                node.id,
                node.role(),
                node.port_peer,
                node.port_rpc,
                node.port_ws,
                node.public_key
            );
        }
    }
}

fn check_node_binary(binary: &Path) -> Result<()> {
    if binary.components().count() > 1 {
        if binary.is_file() {
            return Ok(());
        }
        return Err(eyre!(
            "node binary {} not found\nhint: build the node binary and pass its path with \
             --binary",
            binary.display()
        ));
    }
    let found = Command::new("which")
        .arg(binary)
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false);
    if found {
        Ok(())
    } else {
        Err(eyre!(
            "'{}' not found in PATH\nhint: build the node binary and make sure it is on your \
             PATH, or pass --binary with its location",
            binary.display()
        ))
    }
}
