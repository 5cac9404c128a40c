//! OS process and TCP port inspection.
//!
//! Everything here shells out to standard Unix tools. `lsof` is
//! preferred for port inspection; `ss` is the fallback. When neither is
//! available the port state is reported as unknown rather than failing
//! the caller.

use std::collections::BTreeMap;
use std::process::Command;

use tracing::{debug, warn};

/// One endpoint currently holding a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortUse {
    pub process: String,
    pub pid: i32,
    /// TCP state as reported by the inspection tool, e.g. `LISTEN` or
    /// `TIME_WAIT`.
    pub state: String,
}

impl PortUse {
    /// TIME_WAIT (and the other closing states) hold no socket a new
    /// bind would conflict with for long; only active states matter
    /// when deciding whether to kill a holder.
    pub fn is_active(&self) -> bool {
        !matches!(
            self.state.as_str(),
            "TIME_WAIT" | "TIME-WAIT" | "CLOSE_WAIT" | "CLOSE-WAIT" | "FIN_WAIT_1" | "FIN_WAIT_2"
                | "FIN-WAIT-1" | "FIN-WAIT-2" | "CLOSING" | "LAST_ACK" | "LAST-ACK"
        )
    }
}

/// Process and port control seam. The production implementation drives
/// Unix tools; tests substitute a stub.
pub trait ProcessControl: Send + Sync {
    /// PIDs whose full command line matches `pattern`.
    fn find_by_pattern(&self, pattern: &str) -> Vec<i32>;

    /// Send `signal` to `pid`. Returns whether the signal was delivered.
    fn kill(&self, pid: i32, signal: i32) -> bool;

    fn is_port_listening(&self, port: u16) -> bool;

    /// Every endpoint currently using `port`, in any TCP state.
    fn port_state(&self, port: u16) -> Vec<PortUse>;

    /// The subset of `ports` that are in use, with their holders.
    fn check_ports_free(&self, ports: &[u16]) -> BTreeMap<u16, Vec<PortUse>> {
        let mut in_use = BTreeMap::new();
        for &port in ports {
            let uses = self.port_state(port);
            if !uses.is_empty() {
                in_use.insert(port, uses);
            }
        }
        in_use
    }
}

#[derive(Debug, Clone, Default)]
pub struct UnixProcessManager;

impl UnixProcessManager {
    fn lsof_port(&self, port: u16) -> Option<Vec<PortUse>> {
        let output = Command::new("lsof")
            .args(["-P", "-n", "-i", &format!(":{port}")])
            .output()
            .ok()?;
        // lsof exits non-zero when nothing matches; that is still an
        // answer, not a tool failure.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut uses = Vec::new();
        for line in stdout.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 2 {
                continue;
            }
            let pid = match fields[1].parse::<i32>() {
                Ok(pid) => pid,
                Err(_) => continue,
            };
            let state = fields
                .last()
                .filter(|f| f.starts_with('(') && f.ends_with(')'))
                .map(|f| f.trim_matches(|c| c == '(' || c == ')').to_string())
                .unwrap_or_else(|| "UNKNOWN".to_string());
            uses.push(PortUse {
                process: fields[0].to_string(),
                pid,
                state,
            });
        }
        Some(uses)
    }

    fn ss_port(&self, port: u16) -> Option<Vec<PortUse>> {
        let output = Command::new("ss")
            .args(["-tanp", &format!("sport = :{port}")])
            .output()
            .ok()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut uses = Vec::new();
        for line in stdout.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.is_empty() {
                continue;
            }
            let state = fields[0].to_string();
            // users:(("ledgerd",pid=1234,fd=27))
            let (process, pid) = line
                .split_once("((\"")
                .and_then(|(_, rest)| {
                    let name = rest.split('"').next()?.to_string();
                    let pid = rest
                        .split("pid=")
                        .nth(1)?
                        .split(',')
                        .next()?
                        .parse::<i32>()
                        .ok()?;
                    Some((name, pid))
                })
                .unwrap_or_else(|| ("unknown".to_string(), 0));
            uses.push(PortUse {
                process,
                pid,
                state,
            });
        }
        Some(uses)
    }
}

impl ProcessControl for UnixProcessManager {
    fn find_by_pattern(&self, pattern: &str) -> Vec<i32> {
        let output = match Command::new("pgrep").args(["-f", pattern]).output() {
            Ok(output) => output,
            Err(e) => {
                warn!("pgrep unavailable: {e}");
                return Vec::new();
            }
        };
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.trim().parse::<i32>().ok())
            .collect()
    }

    fn kill(&self, pid: i32, signal: i32) -> bool {
        match Command::new("kill")
            .args([format!("-{signal}"), pid.to_string()])
            .output()
        {
            Ok(output) => output.status.success(),
            Err(e) => {
                warn!(pid, "kill unavailable: {e}");
                false
            }
        }
    }

    fn is_port_listening(&self, port: u16) -> bool {
        self.port_state(port)
            .iter()
            .any(|u| u.state == "LISTEN")
    }

    fn port_state(&self, port: u16) -> Vec<PortUse> {
        if let Some(uses) = self.lsof_port(port) {
            return uses;
        }
        debug!(port, "lsof unavailable, falling back to ss");
        if let Some(uses) = self.ss_port(port) {
            return uses;
        }
        warn!(port, "neither lsof nor ss available, cannot determine port state");
        Vec::new()
    }
}
