//! Orchestration of a local multi-node `ledgerd` validator network.
//!
//! This crate generates validator identities and per-node configuration
//! files, launches the node binary inside a terminal-multiplexer session,
//! watches ledger progress over RPC and the websocket event stream, and
//! tears the whole network down again. Everything runs on loopback; node
//! `i` listens on `base_port + i` for each port family.
//!
//! The CLI in `src/main.rs` is a thin layer over [`TestNetwork`].

pub mod config;
pub mod generator;
pub mod keys;
pub mod launcher;
pub mod logs;
pub mod monitor;
pub mod network;
pub mod process;
pub mod rpc;
pub mod stream;

pub use config::{LaunchConfig, NetworkConfig, NetworkDescriptor, NodeInfo};
pub use network::TestNetwork;
