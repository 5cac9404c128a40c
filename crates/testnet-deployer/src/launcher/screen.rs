//! GNU screen backend: one window per node in a detached session.

use std::process::Command;

use tracing::{debug, error, info};

use super::{node_command, Launcher, SESSION_NAME};
use crate::config::{LaunchConfig, NodeInfo};

#[derive(Debug, Default)]
pub struct ScreenLauncher {
    windows: usize,
}

fn screen(args: &[&str]) -> bool {
    match Command::new("screen").args(args).output() {
        Ok(output) => {
            if !output.status.success() {
                debug!(
                    "screen {} failed: {}",
                    args.join(" "),
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            output.status.success()
        }
        Err(e) => {
            debug!("screen not runnable: {e}");
            false
        }
    }
}

impl Launcher for ScreenLauncher {
    fn name(&self) -> &'static str {
        "screen"
    }

    fn is_available(&self) -> bool {
        // screen -v exits non-zero on some builds; spawnability is
        // the signal that matters.
        Command::new("screen").arg("-v").output().is_ok()
    }

    fn launch(&mut self, node: &NodeInfo, launch: &LaunchConfig) -> bool {
        let window_title = format!("n{}", node.id);
        if self.windows == 0 {
            screen(&["-S", SESSION_NAME, "-X", "quit"]);
            if !screen(&["-dmS", SESSION_NAME, "-t", &window_title]) {
                error!("failed to create screen session {SESSION_NAME}");
                return false;
            }
        } else if !screen(&["-S", SESSION_NAME, "-X", "screen", "-t", &window_title]) {
            error!(node_id = node.id, "failed to add screen window");
            return false;
        }
        let window_index = self.windows.to_string();
        self.windows += 1;
        // `stuff` types into the window; the trailing newline submits.
        let command = format!("{}\n", node_command(node, launch));
        if !screen(&["-S", SESSION_NAME, "-p", &window_index, "-X", "stuff", &command]) {
            error!(node_id = node.id, "failed to send launch command to screen");
            return false;
        }
        true
    }

    fn finalize(&mut self) {
        if self.windows > 0 {
            info!("nodes running; attach with `screen -r {SESSION_NAME}`");
        }
    }

    fn shutdown_session(&self) -> bool {
        screen(&["-S", SESSION_NAME, "-X", "quit"])
    }
}
