use std::path::PathBuf;

use clap::Parser;
use color_eyre::Result;
use testnet_deployer::config::NetworkConfig;
use testnet_deployer::process::UnixProcessManager;
use testnet_deployer::TestNetwork;
use tracing::info;

use super::Run;

#[derive(Debug, Parser)]
pub struct Clean {
    /// Base directory of the generated network.
    #[arg(long, default_value = "testnet")]
    pub directory: PathBuf,
}

impl Run for Clean {
    async fn run(self) -> Result<()> {
        let mut network = TestNetwork::new(
            self.directory,
            NetworkConfig::default(),
            Box::new(UnixProcessManager),
        );
        network.clean()?;
        info!("generated files removed");
        Ok(())
    }
}
