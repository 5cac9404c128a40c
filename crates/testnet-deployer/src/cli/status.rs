use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::Result;
use testnet_deployer::config::{NetworkConfig, NodeInfo};
use testnet_deployer::process::{ProcessControl, UnixProcessManager};
use testnet_deployer::TestNetwork;

use super::Run;

#[derive(Debug, Parser)]
pub struct Status {
    /// Base directory of the generated network.
    #[arg(long, default_value = "testnet")]
    pub directory: PathBuf,
}

impl Run for Status {
    async fn run(self) -> Result<()> {
        let mut network = TestNetwork::new(
            self.directory,
            NetworkConfig::default(),
            Box::new(UnixProcessManager),
        );
        network.load()?;
        network.print_summary();

        let rows = listen_states(network.nodes().to_vec(), Arc::new(UnixProcessManager)).await?;
        println!();
        println!(
            "{:<5} {:<10} {:>12} {:>12} {:>12}",
            "node", "role", "peer", "rpc", "ws"
        );
        for (node, [peer, rpc, ws]) in rows {
            let mark = |listening: bool| if listening { "LISTEN" } else { "-" };
            println!(
                "{:<5} {:<10} {:>12} {:>12} {:>12}",
                node.id,
                node.role(),
                mark(peer),
                mark(rpc),
                mark(ws),
            );
        }
        Ok(())
    }
}

/// Probe every node's three ports concurrently, one blocking worker per
/// node; the port tools are subprocess calls and would otherwise run
/// serially.
async fn listen_states(
    nodes: Vec<NodeInfo>,
    process: Arc<dyn ProcessControl>,
) -> Result<Vec<(NodeInfo, [bool; 3])>> {
    let checks = nodes.into_iter().map(|node| {
        let process = Arc::clone(&process);
        tokio::task::spawn_blocking(move || {
            let states = [
                process.is_port_listening(node.port_peer),
                process.is_port_listening(node.port_rpc),
                process.is_port_listening(node.port_ws),
            ];
            (node, states)
        })
    });
    let mut rows = Vec::new();
    for row in futures::future::join_all(checks).await {
        rows.push(row?);
    }
    Ok(rows)
}
