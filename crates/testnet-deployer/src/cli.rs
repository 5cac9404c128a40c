//! CLI commands, one module per subcommand.

mod clean;
mod generate;
mod logs;
mod monitor;
mod run_network;
mod status;
mod teardown;

use std::future::Future;

use clap::Parser;
use color_eyre::Result;

#[derive(Debug, Parser)]
#[command(name = "testnet-deployer", version)]
#[command(about = "Orchestrate a local multi-node ledgerd validator network")]
pub enum Options {
    /// Generate keys and configuration for a new test network.
    Generate(generate::Generate),
    /// Launch the generated network in a terminal multiplexer.
    Run(run_network::RunNetwork),
    /// Watch ledger progress across the running network.
    Monitor(monitor::Monitor),
    /// Kill node processes and remove all generated files.
    Teardown(teardown::Teardown),
    /// Remove generated files without touching running processes.
    Clean(clean::Clean),
    /// Show per-node port status.
    Status(status::Status),
    /// Merge and search node debug logs.
    Logs(logs::Logs),
}

pub trait Run {
    fn run(self) -> impl Future<Output = Result<()>> + Send;
}

impl Run for Options {
    async fn run(self) -> Result<()> {
        match self {
            Options::Generate(cmd) => cmd.run().await,
            Options::Run(cmd) => cmd.run().await,
            Options::Monitor(cmd) => cmd.run().await,
            Options::Teardown(cmd) => cmd.run().await,
            Options::Clean(cmd) => cmd.run().await,
            Options::Status(cmd) => cmd.run().await,
            Options::Logs(cmd) => cmd.run().await,
        }
    }
}
