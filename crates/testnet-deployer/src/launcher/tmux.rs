//! tmux backend: all nodes as tiled panes in one detached session.

use std::process::Command;

use tracing::{debug, error, info};

use super::{node_command, Launcher, SESSION_NAME};
use crate::config::{LaunchConfig, NodeInfo};

#[derive(Debug, Default)]
pub struct TmuxLauncher {
    session_started: bool,
}

fn tmux(args: &[&str]) -> bool {
    match Command::new("tmux").args(args).output() {
        Ok(output) => {
            if !output.status.success() {
                debug!(
                    "tmux {} failed: {}",
                    args.join(" "),
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            output.status.success()
        }
        Err(e) => {
            debug!("tmux not runnable: {e}");
            false
        }
    }
}

impl Launcher for TmuxLauncher {
    fn name(&self) -> &'static str {
        "tmux"
    }

    fn is_available(&self) -> bool {
        tmux(&["-V"])
    }

    fn launch(&mut self, node: &NodeInfo, launch: &LaunchConfig) -> bool {
        if !self.session_started {
            // A leftover session from an earlier run would swallow the
            // new panes.
            tmux(&["kill-session", "-t", SESSION_NAME]);
            if !tmux(&["new-session", "-d", "-s", SESSION_NAME, "-n", "nodes"]) {
                error!("failed to create tmux session {SESSION_NAME}");
                return false;
            }
            self.session_started = true;
        } else {
            if !tmux(&["split-window", "-t", SESSION_NAME]) {
                error!(node_id = node.id, "failed to add tmux pane");
                return false;
            }
            tmux(&["select-layout", "-t", SESSION_NAME, "tiled"]);
        }
        let command = node_command(node, launch);
        if !tmux(&["send-keys", "-t", SESSION_NAME, &command, "Enter"]) {
            error!(node_id = node.id, "failed to send launch command to tmux");
            return false;
        }
        true
    }

    fn finalize(&mut self) {
        if self.session_started {
            tmux(&["select-layout", "-t", SESSION_NAME, "tiled"]);
            info!("nodes running; attach with `tmux attach -t {SESSION_NAME}`");
        }
    }

    fn shutdown_session(&self) -> bool {
        tmux(&["kill-session", "-t", SESSION_NAME])
    }
}
