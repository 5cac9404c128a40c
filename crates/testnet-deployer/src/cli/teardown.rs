use std::path::PathBuf;

use clap::Parser;
use color_eyre::Result;
use testnet_deployer::config::NetworkConfig;
use testnet_deployer::launcher::select_launcher;
use testnet_deployer::process::UnixProcessManager;
use testnet_deployer::TestNetwork;

use super::Run;

#[derive(Debug, Parser)]
pub struct Teardown {
    /// Base directory of the generated network.
    #[arg(long, default_value = "testnet")]
    pub directory: PathBuf,
}

impl Run for Teardown {
    async fn run(self) -> Result<()> {
        let mut network = TestNetwork::new(
            self.directory,
            NetworkConfig::default(),
            Box::new(UnixProcessManager),
        );
        // Teardown still works with no multiplexer installed; the
        // session is just skipped.
        let killed = match select_launcher(None) {
            Ok(mut launcher) => network.teardown(Some(launcher.as_mut()))?,
            Err(_) => network.teardown(None)?,
        };
        println!("killed {killed} node processes");
        Ok(())
    }
}
