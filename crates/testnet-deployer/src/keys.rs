//! Validator identity material, produced by the external
//! `validator-keys` tool.

use std::path::{Path, PathBuf};
use std::process::Command;

use color_eyre::eyre::{eyre, Result, WrapErr};
use tracing::debug;

/// Identity material for one node.
#[derive(Debug, Clone)]
pub struct ValidatorKeys {
    pub public_key: String,
    pub token: String,
    pub keyfile: PathBuf,
}

/// Produces per-node identity material. The production implementation
/// shells out to the key tool; tests substitute a stub.
pub trait KeyGenerator {
    fn generate(&self, node_id: usize, node_dir: &Path) -> Result<ValidatorKeys>;
}

/// Drives the `validator-keys` binary: `create_keys` writes a JSON
/// keyfile, `create_token` prints a multi-line token to stdout.
#[derive(Debug, Clone)]
pub struct ValidatorKeysTool {
    pub binary: String,
}

impl Default for ValidatorKeysTool {
    fn default() -> Self {
        Self {
            binary: "validator-keys".to_string(),
        }
    }
}

impl ValidatorKeysTool {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn run_tool(&self, args: &[&str], keyfile: &Path) -> Result<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .arg(keyfile)
            .output()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    eyre!(
                        "'{}' not found in PATH\nhint: build the validator-keys tool and make \
                         sure it is on your PATH, or pass --key-tool with its location",
                        self.binary
                    )
                } else {
                    eyre!("failed to execute '{}': {e}", self.binary)
                }
            })?;
        if !output.status.success() {
            return Err(eyre!(
                "'{} {}' failed: {}",
                self.binary,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl KeyGenerator for ValidatorKeysTool {
    fn generate(&self, node_id: usize, node_dir: &Path) -> Result<ValidatorKeys> {
        std::fs::create_dir_all(node_dir)
            .wrap_err_with(|| format!("failed to create {}", node_dir.display()))?;
        let keyfile = node_dir.join("validator-keys.json");

        debug!(node_id, keyfile = %keyfile.display(), "creating validator keys");
        self.run_tool(&["create_keys", "--keyfile"], &keyfile)?;

        let token_output = self.run_tool(&["create_token", "--keyfile"], &keyfile)?;
        let token = parse_token(&token_output).ok_or_else(|| {
            eyre!("no [validator_token] section in create_token output for node {node_id}")
        })?;

        let contents = std::fs::read_to_string(&keyfile)
            .wrap_err_with(|| format!("failed to read {}", keyfile.display()))?;
        let keys: serde_json::Value = serde_json::from_str(&contents)
            .wrap_err_with(|| format!("malformed keyfile {}", keyfile.display()))?;
        let public_key = keys
            .get("public_key")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| eyre!("keyfile {} has no public_key", keyfile.display()))?
            .to_string();

        Ok(ValidatorKeys {
            public_key,
            token,
            keyfile,
        })
    }
}

/// Extract the token lines that follow a `[validator_token]` header,
/// up to the next blank line or section header.
pub(crate) fn parse_token(output: &str) -> Option<String> {
    let mut lines = Vec::new();
    let mut in_token = false;
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed == "[validator_token]" {
            in_token = true;
            continue;
        }
        if in_token {
            if trimmed.is_empty() || trimmed.starts_with('[') {
                break;
            }
            lines.push(trimmed.to_string());
        }
    }
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}
