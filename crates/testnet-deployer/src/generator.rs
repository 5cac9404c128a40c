//! Rendering of per-node configuration files and the validator roster.
//!
//! Generation is two-phase: identity material for every node is created
//! first, so a key-tool failure aborts before anything is rendered, and
//! only then are the roster and per-node configs written out.

use std::path::{Path, PathBuf};

use color_eyre::eyre::{Result, WrapErr};
use tracing::{debug, info};

use crate::config::{NetworkConfig, NodeInfo};
use crate::keys::{KeyGenerator, ValidatorKeys};

pub const CONFIG_FILE: &str = "ledgerd.cfg";
pub const ROSTER_FILE: &str = "validators.txt";

/// Directory for node `i` underneath the base directory.
pub fn node_dir(base_dir: &Path, node_id: usize) -> PathBuf {
    base_dir.join(format!("n{node_id}"))
}

/// Generate keys and configuration for every node. The caller is
/// responsible for wiping stale node directories beforehand.
pub fn generate_all(
    base_dir: &Path,
    config: &NetworkConfig,
    key_generator: &dyn KeyGenerator,
    log_levels: &[(String, String)],
) -> Result<Vec<NodeInfo>> {
    std::fs::create_dir_all(base_dir)
        .wrap_err_with(|| format!("failed to create {}", base_dir.display()))?;

    // Phase 1: identity material for all nodes.
    let mut keys: Vec<ValidatorKeys> = Vec::with_capacity(config.node_count);
    for node_id in 0..config.node_count {
        info!(node_id, "generating validator keys");
        let dir = node_dir(base_dir, node_id);
        keys.push(key_generator.generate(node_id, &dir)?);
    }

    // Phase 2: roster, then per-node configs.
    let roster_path = base_dir.join(ROSTER_FILE);
    let public_keys: Vec<&str> = keys.iter().map(|k| k.public_key.as_str()).collect();
    std::fs::write(&roster_path, render_roster(&public_keys))
        .wrap_err_with(|| format!("failed to write {}", roster_path.display()))?;

    let mut nodes = Vec::with_capacity(config.node_count);
    for (node_id, key) in keys.iter().enumerate() {
        let dir = node_dir(base_dir, node_id);
        let config_path = dir.join(CONFIG_FILE);
        let rendered = render_node_config(node_id, &dir, &roster_path, key, config, log_levels);
        std::fs::write(&config_path, rendered)
            .wrap_err_with(|| format!("failed to write {}", config_path.display()))?;
        debug!(node_id, config = %config_path.display(), "wrote node config");

        nodes.push(NodeInfo {
            id: node_id,
            public_key: key.public_key.clone(),
            token: key.token.clone(),
            config_path,
            port_peer: config.port_peer(node_id),
            port_rpc: config.port_rpc(node_id),
            port_ws: config.port_ws(node_id),
            is_injector: node_id == 0,
        });
    }
    Ok(nodes)
}

/// One public key per line; the node binary treats every listed key as
/// a trusted validator.
pub(crate) fn render_roster(public_keys: &[&str]) -> String {
    let mut out = String::from("[validators]\n");
    for key in public_keys {
        out.push_str(key);
        out.push('\n');
    }
    out
}

fn render_node_config(
    node_id: usize,
    dir: &Path,
    roster_path: &Path,
    key: &ValidatorKeys,
    config: &NetworkConfig,
    log_levels: &[(String, String)],
) -> String {
    // Every other node's peer port, so the cluster meshes over loopback
    // without discovery.
    let ips_fixed = (0..config.node_count)
        .filter(|&peer| peer != node_id)
        .map(|peer| format!("127.0.0.1 {}", config.port_peer(peer)))
        .collect::<Vec<_>>()
        .join("\n");

    let mut rpc_startup = String::from(r#"{"command": "log_level", "severity": "warn"}"#);
    for (partition, severity) in log_levels {
        rpc_startup.push('\n');
        rpc_startup.push_str(&format!(
            r#"{{"command": "log_level", "partition": "{partition}", "severity": "{severity}"}}"#
        ));
    }

    format!(
        r#"[server]
port_peer
port_rpc_admin_local
port_ws_public

[port_peer]
port = {port_peer}
ip = 0.0.0.0
protocol = peer

[port_rpc_admin_local]
port = {port_rpc}
ip = 127.0.0.1
admin = 127.0.0.1
protocol = http

[port_ws_public]
port = {port_ws}
ip = 127.0.0.1
admin = 127.0.0.1
protocol = ws

[node_size]
small

[node_db]
type=NuDB
path={dir}/db/nudb

[database_path]
{dir}/db

[debug_logfile]
{dir}/debug.log

[sntp_servers]
time.nist.gov

[ips_fixed]
{ips_fixed}

[validators_file]
{roster}

[validator_token]
{token}

[network_id]
{network_id}

[rpc_startup]
{rpc_startup}

[ssl_verify]
0
"#,
        port_peer = config.port_peer(node_id),
        port_rpc = config.port_rpc(node_id),
        port_ws = config.port_ws(node_id),
        dir = dir.display(),
        roster = roster_path.display(),
        token = key.token,
        network_id = config.network_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sample_keys() -> ValidatorKeys {
        ValidatorKeys {
            public_key: "nHUpk".into(),
            token: "tokenline1\ntokenline2".into(),
            keyfile: PathBuf::from("/tmp/net/n1/validator-keys.json"),
        }
    }

    #[test]
    fn test_roster_lists_every_key() {
        let roster = render_roster(&["nHUa", "nHUb", "nHUc"]);
        assert!(roster.starts_with("[validators]\n"));
        assert_eq!(roster.matches('\n').count(), 4);
        for key in ["nHUa", "nHUb", "nHUc"] {
            assert!(roster.contains(key));
        }
    }

    #[test]
    fn test_config_meshes_other_peers_only() {
        let config = NetworkConfig {
            node_count: 3,
            ..NetworkConfig::default()
        };
        let rendered = render_node_config(
            1,
            Path::new("/tmp/net/n1"),
            Path::new("/tmp/net/validators.txt"),
            &sample_keys(),
            &config,
            &[],
        );
        assert!(rendered.contains("127.0.0.1 51235"));
        assert!(rendered.contains("127.0.0.1 51237"));
        // A node never lists its own peer port.
        assert!(!rendered.contains("127.0.0.1 51236"));
        assert!(rendered.contains("port = 51236"));
        assert!(rendered.contains("port = 5006"));
        assert!(rendered.contains("port = 6006"));
        assert!(rendered.contains("tokenline1\ntokenline2"));
        assert!(rendered.contains("99999"));
    }

    #[test]
    fn test_log_level_overrides_rendered_into_rpc_startup() {
        let config = NetworkConfig::default();
        let rendered = render_node_config(
            0,
            Path::new("/tmp/net/n0"),
            Path::new("/tmp/net/validators.txt"),
            &sample_keys(),
            &config,
            &[("Consensus".into(), "trace".into())],
        );
        assert!(rendered
            .contains(r#"{"command": "log_level", "partition": "Consensus", "severity": "trace"}"#));
    }
}
