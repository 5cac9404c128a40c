use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::{eyre, Result};
use testnet_deployer::config::{
    NetworkConfig, DEFAULT_BASE_PORT_PEER, DEFAULT_BASE_PORT_RPC, DEFAULT_BASE_PORT_WS,
    DEFAULT_NETWORK_ID, DEFAULT_NODE_COUNT,
};
use testnet_deployer::keys::ValidatorKeysTool;
use testnet_deployer::process::UnixProcessManager;
use testnet_deployer::TestNetwork;

use super::Run;

#[derive(Debug, Parser)]
pub struct Generate {
    /// Base directory for all generated files.
    #[arg(long, default_value = "testnet")]
    pub directory: PathBuf,

    #[arg(long, default_value_t = DEFAULT_NODE_COUNT)]
    pub nodes: usize,

    #[arg(long, default_value_t = DEFAULT_NETWORK_ID)]
    pub network_id: u32,

    #[arg(long, default_value_t = DEFAULT_BASE_PORT_PEER)]
    pub base_port_peer: u16,

    #[arg(long, default_value_t = DEFAULT_BASE_PORT_RPC)]
    pub base_port_rpc: u16,

    #[arg(long, default_value_t = DEFAULT_BASE_PORT_WS)]
    pub base_port_ws: u16,

    /// Remap base ports upward instead of failing on conflicts.
    #[arg(long)]
    pub find_ports: bool,

    /// Log-level startup overrides baked into every node config.
    #[arg(long = "log-level", value_name = "PARTITION=SEVERITY")]
    pub log_levels: Vec<String>,

    /// Name or path of the validator key tool.
    #[arg(long, default_value = "validator-keys")]
    pub key_tool: String,
}

impl Run for Generate {
    async fn run(self) -> Result<()> {
        let config = NetworkConfig {
            network_id: self.network_id,
            node_count: self.nodes,
            base_port_peer: self.base_port_peer,
            base_port_rpc: self.base_port_rpc,
            base_port_ws: self.base_port_ws,
        };
        let log_levels = parse_log_levels(&self.log_levels)?;
        let mut network =
            TestNetwork::new(self.directory, config, Box::new(UnixProcessManager));
        let key_tool = ValidatorKeysTool::new(self.key_tool);
        network.generate(&key_tool, &log_levels, self.find_ports)?;
        network.print_summary();
        Ok(())
    }
}

fn parse_log_levels(raw: &[String]) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(partition, severity)| (partition.to_string(), severity.to_string()))
                .ok_or_else(|| eyre!("bad log level '{pair}', expected PARTITION=SEVERITY"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_levels() {
        let parsed = parse_log_levels(&["Consensus=trace".into(), "Peer=debug".into()]).unwrap();
        assert_eq!(
            parsed,
            vec![
                ("Consensus".to_string(), "trace".to_string()),
                ("Peer".to_string(), "debug".to_string()),
            ]
        );
        assert!(parse_log_levels(&["nope".into()]).is_err());
    }
}
