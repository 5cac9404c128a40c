use std::path::PathBuf;

use clap::Parser;
use color_eyre::Result;
use testnet_deployer::config::NetworkConfig;
use testnet_deployer::process::UnixProcessManager;
use testnet_deployer::TestNetwork;
use tokio::sync::watch;

use super::Run;

#[derive(Debug, Parser)]
pub struct Monitor {
    /// Base directory of the generated network.
    #[arg(long, default_value = "testnet")]
    pub directory: PathBuf,

    /// Amendment id to track in the status table.
    #[arg(long)]
    pub amendment: Option<String>,
}

impl Run for Monitor {
    async fn run(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            let _ = shutdown_tx.send(true);
        });

        let mut network = TestNetwork::new(
            self.directory,
            NetworkConfig::default(),
            Box::new(UnixProcessManager),
        );
        network.monitor(self.amendment, shutdown_rx).await
    }
}
