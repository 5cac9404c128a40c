//! Pluggable node launchers.
//!
//! A launcher places each node's command into a terminal-multiplexer
//! session so an operator can attach and watch every node live. Killing
//! node processes is not the launcher's job; teardown always goes
//! through [`crate::process::ProcessControl`], whether or not the
//! session is still around.

mod screen;
mod tmux;

pub use screen::ScreenLauncher;
pub use tmux::TmuxLauncher;

use color_eyre::eyre::{eyre, Result};

use crate::config::{LaunchConfig, NodeInfo};

/// Multiplexer session name shared by all backends.
pub const SESSION_NAME: &str = "ledgerd-testnet";

pub trait Launcher: Send {
    fn name(&self) -> &'static str;

    fn is_available(&self) -> bool;

    /// Start one node. Returns whether the launch command was accepted;
    /// a failure is logged by the implementation and must not panic.
    fn launch(&mut self, node: &NodeInfo, launch: &LaunchConfig) -> bool;

    /// Cosmetic wrap-up after the last launch (layout, attach hints).
    /// Never fails.
    fn finalize(&mut self);

    /// Tear down the multiplexer session. Returns whether a session was
    /// present.
    fn shutdown_session(&self) -> bool;
}

/// Pick a launcher: by name when requested, otherwise the first
/// available backend in preference order.
pub fn select_launcher(kind: Option<&str>) -> Result<Box<dyn Launcher>> {
    match kind {
        Some("tmux") => {
            let launcher = TmuxLauncher::default();
            if !launcher.is_available() {
                return Err(eyre!("tmux not found in PATH\nhint: install tmux"));
            }
            Ok(Box::new(launcher))
        }
        Some("screen") => {
            let launcher = ScreenLauncher::default();
            if !launcher.is_available() {
                return Err(eyre!("screen not found in PATH\nhint: install GNU screen"));
            }
            Ok(Box::new(launcher))
        }
        Some(other) => Err(eyre!(
            "unknown launcher '{other}'\nhint: available launchers are tmux, screen"
        )),
        None => {
            let tmux = TmuxLauncher::default();
            if tmux.is_available() {
                return Ok(Box::new(tmux));
            }
            let screen = ScreenLauncher::default();
            if screen.is_available() {
                return Ok(Box::new(screen));
            }
            Err(eyre!(
                "no terminal multiplexer found\nhint: install tmux or GNU screen"
            ))
        }
    }
}

/// The full shell command for one node: cd into its directory, export
/// its environment, then exec the node binary.
pub(crate) fn node_command(node: &NodeInfo, launch: &LaunchConfig) -> String {
    let mut env: Vec<(String, String)> = vec![
        ("LOG_DATE_FORMAT".into(), format!("N{} %T", node.id)),
        ("NO_COLOR".into(), "1".into()),
    ];
    if let Some(amendment_id) = &launch.amendment_id {
        env.push(("AMENDMENT_ID".into(), amendment_id.clone()));
    }
    if node.is_injector {
        if let Some(every) = launch.inject_every {
            env.push(("INJECT_EVERY".into(), every.to_string()));
        }
    }
    for (key, value) in &launch.env {
        env.push((key.clone(), value.clone()));
    }
    if let Some(overrides) = launch.node_env.get(&node.id) {
        for (key, value) in overrides {
            env.push((key.clone(), value.clone()));
        }
    }

    let exports = env
        .iter()
        .map(|(key, value)| format!("export {key}='{value}'"))
        .collect::<Vec<_>>()
        .join("; ");

    let mut command = format!(
        "cd '{dir}' && {exports}; exec '{binary}' --conf '{config}' --ledgerfile '{genesis}'",
        dir = node.node_dir().display(),
        binary = launch.node_binary.display(),
        config = node.config_path.display(),
        genesis = launch.genesis_file.display(),
    );
    if let Some(quorum) = launch.quorum {
        command.push_str(&format!(" --quorum {quorum}"));
    }
    for arg in &launch.extra_args {
        command.push(' ');
        command.push_str(arg);
    }
    command
}
