use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{eyre, Result};
use testnet_deployer::config::{LaunchConfig, NetworkConfig};
use testnet_deployer::launcher::select_launcher;
use testnet_deployer::process::UnixProcessManager;
use testnet_deployer::TestNetwork;

use super::Run;

#[derive(Debug, Parser)]
pub struct RunNetwork {
    /// Base directory of the generated network.
    #[arg(long, default_value = "testnet")]
    pub directory: PathBuf,

    /// Node binary, as a path or a name on PATH.
    #[arg(long, default_value = "ledgerd")]
    pub binary: PathBuf,

    /// Genesis ledger file passed to every node.
    #[arg(long)]
    pub genesis: PathBuf,

    /// Fixed validation quorum instead of the node's automatic one.
    #[arg(long)]
    pub quorum: Option<u32>,

    /// Amendment id exported to every node's environment.
    #[arg(long)]
    pub amendment: Option<String>,

    /// Inject a transaction every N ledgers on the primary node.
    #[arg(long)]
    pub inject_every: Option<u32>,

    /// Seconds to pause between consecutive node launches.
    #[arg(long, default_value_t = 0)]
    pub delay: u64,

    /// Environment overrides applied to every node.
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Per-node environment overrides.
    #[arg(long = "node-env", value_name = "NODE:KEY=VALUE")]
    pub node_env: Vec<String>,

    /// Launcher backend (tmux or screen); auto-detected when omitted.
    #[arg(long)]
    pub launcher: Option<String>,

    /// Extra arguments appended to every node command, after `--`.
    #[arg(last = true)]
    pub extra_args: Vec<String>,
}

impl Run for RunNetwork {
    async fn run(self) -> Result<()> {
        let launch = LaunchConfig {
            node_binary: self.binary,
            genesis_file: self.genesis,
            quorum: self.quorum,
            amendment_id: self.amendment,
            inject_every: self.inject_every,
            launch_delay: Duration::from_secs(self.delay),
            env: parse_env_pairs(&self.env)?,
            node_env: parse_node_env_pairs(&self.node_env)?,
            extra_args: self.extra_args,
        };
        let mut launcher = select_launcher(self.launcher.as_deref())?;
        let mut network = TestNetwork::new(
            self.directory,
            NetworkConfig::default(),
            Box::new(UnixProcessManager),
        );
        network.run(&launch, launcher.as_mut())
    }
}

fn parse_env_pairs(raw: &[String]) -> Result<HashMap<String, String>> {
    raw.iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .ok_or_else(|| eyre!("bad env override '{pair}', expected KEY=VALUE"))
        })
        .collect()
}

fn parse_node_env_pairs(raw: &[String]) -> Result<HashMap<usize, HashMap<String, String>>> {
    let mut by_node: HashMap<usize, HashMap<String, String>> = HashMap::new();
    for pair in raw {
        let (node, rest) = pair
            .split_once(':')
            .ok_or_else(|| eyre!("bad node env override '{pair}', expected NODE:KEY=VALUE"))?;
        let node: usize = node
            .parse()
            .map_err(|_| eyre!("bad node id in '{pair}', expected NODE:KEY=VALUE"))?;
        let (key, value) = rest
            .split_once('=')
            .ok_or_else(|| eyre!("bad node env override '{pair}', expected NODE:KEY=VALUE"))?;
        by_node
            .entry(node)
            .or_default()
            .insert(key.to_string(), value.to_string());
    }
    Ok(by_node)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_pairs() {
        let env = parse_env_pairs(&["A=1".into(), "B=two=2".into()]).unwrap();
        assert_eq!(env["A"], "1");
        assert_eq!(env["B"], "two=2");
        assert!(parse_env_pairs(&["broken".into()]).is_err());
    }

    #[test]
    fn test_parse_node_env_pairs() {
        let env = parse_node_env_pairs(&["0:TRACE=1".into(), "0:X=y".into(), "2:Z=3".into()])
            .unwrap();
        assert_eq!(env[&0].len(), 2);
        assert_eq!(env[&2]["Z"], "3");
        assert!(parse_node_env_pairs(&["TRACE=1".into()]).is_err());
        assert!(parse_node_env_pairs(&["x:TRACE=1".into()]).is_err());
    }
}
