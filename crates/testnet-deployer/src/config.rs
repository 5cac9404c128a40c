//! Network-wide configuration, per-node records, and the persisted
//! network descriptor.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};

pub const DEFAULT_NETWORK_ID: u32 = 99_999;
pub const DEFAULT_NODE_COUNT: usize = 5;
pub const DEFAULT_BASE_PORT_PEER: u16 = 51_235;
pub const DEFAULT_BASE_PORT_RPC: u16 = 5_005;
pub const DEFAULT_BASE_PORT_WS: u16 = 6_005;

/// Filename of the persisted network descriptor in the base directory.
pub const DESCRIPTOR_FILE: &str = "network.json";

/// Immutable network-wide parameters. Node `i` listens on `base + i`
/// for each of the three port families.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub network_id: u32,
    pub node_count: usize,
    pub base_port_peer: u16,
    pub base_port_rpc: u16,
    pub base_port_ws: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            network_id: DEFAULT_NETWORK_ID,
            node_count: DEFAULT_NODE_COUNT,
            base_port_peer: DEFAULT_BASE_PORT_PEER,
            base_port_rpc: DEFAULT_BASE_PORT_RPC,
            base_port_ws: DEFAULT_BASE_PORT_WS,
        }
    }
}

impl NetworkConfig {
    pub fn port_peer(&self, node_id: usize) -> u16 {
        self.base_port_peer + node_id as u16
    }

    pub fn port_rpc(&self, node_id: usize) -> u16 {
        self.base_port_rpc + node_id as u16
    }

    pub fn port_ws(&self, node_id: usize) -> u16 {
        self.base_port_ws + node_id as u16
    }

    /// Every port the network will bind, across all nodes and families.
    pub fn all_ports(&self) -> Vec<u16> {
        (0..self.node_count)
            .flat_map(|i| [self.port_peer(i), self.port_rpc(i), self.port_ws(i)])
            .collect()
    }

    /// Reject configurations whose derived ports would not fit in the
    /// 16-bit port space.
    pub fn validate(&self) -> Result<()> {
        if self.node_count == 0 {
            return Err(eyre!("node count must be at least 1"));
        }
        if self.node_count > usize::from(u16::MAX) {
            return Err(eyre!("node count {} is too large", self.node_count));
        }
        let span = (self.node_count - 1) as u16;
        for (family, base) in [
            ("peer", self.base_port_peer),
            ("rpc", self.base_port_rpc),
            ("ws", self.base_port_ws),
        ] {
            if base.checked_add(span).is_none() {
                return Err(eyre!(
                    "base {family} port {base} leaves no room for {} nodes\nhint: choose a \
                     base port at or below {}",
                    self.node_count,
                    u16::MAX - span
                ));
            }
        }
        Ok(())
    }
}

/// One generated node: identity material, config location, and the
/// ports derived from its id. Node 0 is the primary and is the only
/// node allowed to inject privileged transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: usize,
    pub public_key: String,
    pub token: String,
    #[serde(rename = "config")]
    pub config_path: PathBuf,
    pub port_peer: u16,
    pub port_rpc: u16,
    pub port_ws: u16,
    #[serde(default)]
    pub is_injector: bool,
}

impl NodeInfo {
    /// Directory holding this node's config, database, and debug log.
    pub fn node_dir(&self) -> &Path {
        self.config_path.parent().unwrap_or_else(|| Path::new("."))
    }

    pub fn role(&self) -> &'static str {
        if self.is_injector {
            "primary"
        } else {
            "validator"
        }
    }
}

/// Parameters for launching node processes. Built fresh for each `run`
/// invocation and never persisted.
#[derive(Debug, Clone, Default)]
pub struct LaunchConfig {
    pub node_binary: PathBuf,
    pub genesis_file: PathBuf,
    pub quorum: Option<u32>,
    pub amendment_id: Option<String>,
    /// Inject a transaction every N ledgers on the primary node.
    pub inject_every: Option<u32>,
    /// Pause between consecutive node launches.
    pub launch_delay: Duration,
    /// Environment overrides applied to every node.
    pub env: HashMap<String, String>,
    /// Per-node environment overrides, applied after the global ones.
    pub node_env: HashMap<usize, HashMap<String, String>>,
    /// Extra command-line arguments appended to the node command.
    pub extra_args: Vec<String>,
}

/// The on-disk record of a generated network, written by `generate`
/// and read back by every later command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDescriptor {
    pub network_id: u32,
    pub node_count: usize,
    pub base_port_peer: u16,
    pub base_port_rpc: u16,
    pub base_port_ws: u16,
    pub nodes: Vec<NodeInfo>,
}

impl NetworkDescriptor {
    pub fn new(config: &NetworkConfig, nodes: Vec<NodeInfo>) -> Self {
        Self {
            network_id: config.network_id,
            node_count: config.node_count,
            base_port_peer: config.base_port_peer,
            base_port_rpc: config.base_port_rpc,
            base_port_ws: config.base_port_ws,
            nodes,
        }
    }

    pub fn path(base_dir: &Path) -> PathBuf {
        base_dir.join(DESCRIPTOR_FILE)
    }

    pub fn save(&self, base_dir: &Path) -> Result<()> {
        let path = Self::path(base_dir);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)
            .wrap_err_with(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn load(base_dir: &Path) -> Result<Self> {
        let path = Self::path(base_dir);
        let contents = std::fs::read_to_string(&path).map_err(|e| {
            eyre!(
                "failed to read {}: {e}\nhint: run `testnet-deployer generate` first",
                path.display()
            )
        })?;
        let descriptor: Self = serde_json::from_str(&contents)
            .wrap_err_with(|| format!("malformed network descriptor at {}", path.display()))?;
        Ok(descriptor)
    }

    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            network_id: self.network_id,
            node_count: self.node_count,
            base_port_peer: self.base_port_peer,
            base_port_rpc: self.base_port_rpc,
            base_port_ws: self.base_port_ws,
        }
    }
}
