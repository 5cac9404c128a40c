//! End-to-end orchestration tests over a temp directory, with the key
//! tool, launcher, and process manager stubbed out.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use color_eyre::Result;
use testnet_deployer::config::{LaunchConfig, NetworkConfig, NetworkDescriptor};
use testnet_deployer::generator::{CONFIG_FILE, ROSTER_FILE};
use testnet_deployer::keys::{KeyGenerator, ValidatorKeys};
use testnet_deployer::launcher::Launcher;
use testnet_deployer::process::{PortUse, ProcessControl};
use testnet_deployer::TestNetwork;
use tempfile::TempDir;

struct StubKeyTool;

impl KeyGenerator for StubKeyTool {
    fn generate(&self, node_id: usize, node_dir: &std::path::Path) -> Result<ValidatorKeys> {
        std::fs::create_dir_all(node_dir)?;
        let keyfile = node_dir.join("validator-keys.json");
        std::fs::write(&keyfile, format!(r#"{{"public_key":"nHU{node_id:04}"}}"#))?;
        Ok(ValidatorKeys {
            public_key: format!("nHU{node_id:04}"),
            token: format!("token-{node_id}"),
            keyfile,
        })
    }
}

#[derive(Default)]
struct ProcessState {
    running: Mutex<Vec<i32>>,
    killed: Mutex<Vec<i32>>,
    busy_ports: Mutex<BTreeSet<u16>>,
}

#[derive(Clone, Default)]
struct StubProcess(Arc<ProcessState>);

impl StubProcess {
    fn with_running(pids: &[i32]) -> Self {
        let stub = Self::default();
        *stub.0.running.lock().unwrap() = pids.to_vec();
        stub
    }

    fn with_busy_ports(ports: &[u16]) -> Self {
        let stub = Self::default();
        *stub.0.busy_ports.lock().unwrap() = ports.iter().copied().collect();
        stub
    }

    fn killed(&self) -> Vec<i32> {
        self.0.killed.lock().unwrap().clone()
    }
}

impl ProcessControl for StubProcess {
    fn find_by_pattern(&self, _pattern: &str) -> Vec<i32> {
        self.0.running.lock().unwrap().clone()
    }

    fn kill(&self, pid: i32, _signal: i32) -> bool {
        self.0.running.lock().unwrap().retain(|&p| p != pid);
        self.0.killed.lock().unwrap().push(pid);
        true
    }

    fn is_port_listening(&self, port: u16) -> bool {
        self.0.busy_ports.lock().unwrap().contains(&port)
    }

    fn port_state(&self, port: u16) -> Vec<PortUse> {
        if self.is_port_listening(port) {
            vec![PortUse {
                process: "other".into(),
                pid: 0,
                state: "LISTEN".into(),
            }]
        } else {
            Vec::new()
        }
    }
}

#[derive(Default)]
struct LauncherState {
    launched: Vec<usize>,
    finalized: usize,
    sessions_killed: usize,
}

#[derive(Clone, Default)]
struct StubLauncher(Arc<Mutex<LauncherState>>);

impl Launcher for StubLauncher {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn launch(&mut self, node: &testnet_deployer::NodeInfo, _launch: &LaunchConfig) -> bool {
        self.0.lock().unwrap().launched.push(node.id);
        true
    }

    fn finalize(&mut self) {
        self.0.lock().unwrap().finalized += 1;
    }

    fn shutdown_session(&self) -> bool {
        self.0.lock().unwrap().sessions_killed += 1;
        true
    }
}

fn three_node_config() -> NetworkConfig {
    NetworkConfig {
        node_count: 3,
        ..NetworkConfig::default()
    }
}

#[test]
fn generate_persists_a_reloadable_descriptor() {
    let dir = TempDir::new().unwrap();
    let mut network = TestNetwork::new(
        dir.path(),
        three_node_config(),
        Box::new(StubProcess::default()),
    );
    network.generate(&StubKeyTool, &[], false).unwrap();

    let descriptor = NetworkDescriptor::load(dir.path()).unwrap();
    assert_eq!(descriptor.node_count, 3);
    assert_eq!(descriptor.nodes.len(), 3);
    let rpc_ports: Vec<u16> = descriptor.nodes.iter().map(|n| n.port_rpc).collect();
    assert_eq!(rpc_ports, vec![5_005, 5_006, 5_007]);
    assert!(descriptor.nodes[0].is_injector);
    assert!(descriptor.nodes[1..].iter().all(|n| !n.is_injector));

    // A fresh orchestrator picks the same network back up.
    let mut reloaded = TestNetwork::new(
        dir.path(),
        NetworkConfig::default(),
        Box::new(StubProcess::default()),
    );
    reloaded.load().unwrap();
    assert_eq!(reloaded.config(), &three_node_config());
    assert_eq!(reloaded.nodes(), descriptor.nodes.as_slice());

    // Roster lists every node's key; each node has a rendered config.
    let roster = std::fs::read_to_string(dir.path().join(ROSTER_FILE)).unwrap();
    for node in &descriptor.nodes {
        assert!(roster.contains(&node.public_key));
        assert!(node.config_path.is_file());
        assert!(node.config_path.ends_with(CONFIG_FILE));
    }
}

#[test]
fn generate_wipes_stale_node_directories() {
    let dir = TempDir::new().unwrap();
    let stale = dir.path().join("n7");
    std::fs::create_dir_all(&stale).unwrap();
    std::fs::write(stale.join("debug.log"), "old").unwrap();

    let mut network = TestNetwork::new(
        dir.path(),
        three_node_config(),
        Box::new(StubProcess::default()),
    );
    network.generate(&StubKeyTool, &[], false).unwrap();
    assert!(!stale.exists());
    assert!(dir.path().join("n2").exists());
}

#[test]
fn generate_fails_on_port_conflict_unless_remapping() {
    let dir = TempDir::new().unwrap();
    let mut network = TestNetwork::new(
        dir.path(),
        three_node_config(),
        Box::new(StubProcess::with_busy_ports(&[5_005])),
    );
    let err = network.generate(&StubKeyTool, &[], false).unwrap_err();
    assert!(err.to_string().contains("5005"));

    // With remapping, all three bases shift upward in lockstep.
    let mut network = TestNetwork::new(
        dir.path(),
        three_node_config(),
        Box::new(StubProcess::with_busy_ports(&[5_005])),
    );
    network.generate(&StubKeyTool, &[], true).unwrap();
    assert_eq!(network.config().base_port_rpc, 5_008);
    assert_eq!(network.config().base_port_peer, 51_238);
    assert_eq!(network.config().base_port_ws, 6_008);
}

#[test]
fn generate_rejects_port_ranges_past_u16_max() {
    // 65534 + node ids 0..5 walks past the top of the port space; this
    // must be a configuration error, not an overflow.
    let dir = TempDir::new().unwrap();
    let mut network = TestNetwork::new(
        dir.path(),
        NetworkConfig {
            base_port_ws: 65_534,
            ..NetworkConfig::default()
        },
        Box::new(StubProcess::default()),
    );
    let err = network.generate(&StubKeyTool, &[], false).unwrap_err();
    assert!(err.to_string().contains("ws"));
    // Same config under --find-ports must also refuse, not wrap.
    let err = network.generate(&StubKeyTool, &[], true).unwrap_err();
    assert!(err.to_string().contains("ws"));
}

#[test]
fn run_launches_every_node_and_finalizes_once() {
    let dir = TempDir::new().unwrap();
    let mut network = TestNetwork::new(
        dir.path(),
        three_node_config(),
        Box::new(StubProcess::default()),
    );
    network.generate(&StubKeyTool, &[], false).unwrap();

    let binary = dir.path().join("ledgerd");
    std::fs::write(&binary, "#!/bin/sh\n").unwrap();
    let genesis = dir.path().join("genesis.json");
    std::fs::write(&genesis, "{}").unwrap();

    let launch = LaunchConfig {
        node_binary: binary,
        genesis_file: genesis,
        ..LaunchConfig::default()
    };
    let mut launcher = StubLauncher::default();
    network.run(&launch, &mut launcher.clone()).unwrap();

    let state = launcher.0.lock().unwrap();
    assert_eq!(state.launched, vec![0, 1, 2]);
    assert_eq!(state.finalized, 1);
}

#[test]
fn run_fails_without_node_binary() {
    let dir = TempDir::new().unwrap();
    let mut network = TestNetwork::new(
        dir.path(),
        three_node_config(),
        Box::new(StubProcess::default()),
    );
    network.generate(&StubKeyTool, &[], false).unwrap();

    let launch = LaunchConfig {
        node_binary: dir.path().join("missing-ledgerd"),
        genesis_file: dir.path().join("genesis.json"),
        ..LaunchConfig::default()
    };
    let mut launcher = StubLauncher::default();
    let err = network.run(&launch, &mut launcher).unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[test]
fn teardown_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let process = StubProcess::with_running(&[501, 502]);
    let mut network = TestNetwork::new(
        dir.path(),
        three_node_config(),
        Box::new(process.clone()),
    );
    network.generate(&StubKeyTool, &[], false).unwrap();

    let mut launcher = StubLauncher::default();
    let mut session = launcher.clone();
    let killed = network.teardown(Some(&mut session as &mut dyn Launcher)).unwrap();
    assert_eq!(killed, 2);
    assert_eq!(process.killed(), vec![501, 502]);
    assert!(!NetworkDescriptor::path(dir.path()).exists());
    assert!(!dir.path().join("n0").exists());
    assert_eq!(launcher.0.lock().unwrap().sessions_killed, 1);

    // Nothing left to kill or remove; still succeeds.
    let killed = network.teardown(Some(&mut launcher as &mut dyn Launcher)).unwrap();
    assert_eq!(killed, 0);
}

#[test]
fn teardown_with_nothing_generated_reports_zero() {
    let dir = TempDir::new().unwrap();
    let mut network = TestNetwork::new(
        dir.path(),
        NetworkConfig::default(),
        Box::new(StubProcess::default()),
    );
    assert_eq!(network.teardown(None).unwrap(), 0);
}

#[test]
fn teardown_without_descriptor_kills_nothing() {
    // The stub answers every pattern query with a live pid, the way
    // pgrep -f matches substrings of unrelated command lines (the
    // deployer's own included). With no descriptor there are no
    // per-node config paths to match on, so nothing may be killed.
    let dir = TempDir::new().unwrap();
    let process = StubProcess::with_running(&[31337]);
    let mut network = TestNetwork::new(
        dir.path(),
        NetworkConfig::default(),
        Box::new(process.clone()),
    );
    assert_eq!(network.teardown(None).unwrap(), 0);
    assert!(process.killed().is_empty());
}

#[test]
fn load_fails_before_generate() {
    let dir = TempDir::new().unwrap();
    let mut network = TestNetwork::new(
        dir.path(),
        NetworkConfig::default(),
        Box::new(StubProcess::default()),
    );
    let err = network.load().unwrap_err();
    assert!(err.to_string().contains("generate"));
}
