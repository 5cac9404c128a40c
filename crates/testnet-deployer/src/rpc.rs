//! JSON-over-HTTP client for the node admin API.
//!
//! Every call degrades gracefully: an unreachable or slow node yields
//! `None` with a debug log, a malformed or error response yields `None`
//! with a warning. Callers decide whether absence matters.

use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{debug, warn};

pub const RPC_TIMEOUT: Duration = Duration::from_secs(2);

/// Whether a tracked amendment is live on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmendmentStatus {
    Enabled,
    Disabled,
    /// The node answered but does not know the amendment id.
    NotFound,
    /// The node is up but not synced enough to answer definitions.
    NotSynced,
}

impl AmendmentStatus {
    pub fn symbol(&self) -> &'static str {
        match self {
            AmendmentStatus::Enabled => "yes",
            AmendmentStatus::Disabled => "no",
            AmendmentStatus::NotFound => "?",
            AmendmentStatus::NotSynced => "sync",
        }
    }
}

/// Aggregate snapshot of one node, gathered for the monitor table.
#[derive(Debug, Clone, Default)]
pub struct NodeData {
    pub node_id: usize,
    pub server_info: Option<Value>,
    pub amendment: Option<AmendmentStatus>,
    pub response_time: Duration,
}

#[derive(Debug, Clone)]
pub struct RpcClient {
    base_port_rpc: u16,
    client: reqwest::Client,
}

impl RpcClient {
    pub fn new(base_port_rpc: u16) -> Self {
        Self {
            base_port_rpc,
            client: reqwest::Client::new(),
        }
    }

    pub fn set_base_port(&mut self, base_port_rpc: u16) {
        self.base_port_rpc = base_port_rpc;
    }

    fn url(&self, node_id: usize) -> String {
        format!("http://127.0.0.1:{}", self.base_port_rpc + node_id as u16)
    }

    /// POST `{method, params: [params]}` and return the `result` field.
    pub async fn call(&self, node_id: usize, method: &str, params: Value) -> Option<Value> {
        let payload = json!({ "method": method, "params": [params] });
        let response = match self
            .client
            .post(self.url(node_id))
            .timeout(RPC_TIMEOUT)
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() || e.is_connect() => {
                debug!(node_id, method, "rpc unreachable: {e}");
                return None;
            }
            Err(e) => {
                warn!(node_id, method, "rpc request failed: {e}");
                return None;
            }
        };
        let response = match response.error_for_status() {
            Ok(response) => response,
            Err(e) => {
                warn!(node_id, method, "rpc http error: {e}");
                return None;
            }
        };
        match response.json::<Value>().await {
            Ok(body) => body.get("result").cloned(),
            Err(e) => {
                warn!(node_id, method, "malformed rpc response: {e}");
                None
            }
        }
    }

    pub async fn server_info(&self, node_id: usize) -> Option<Value> {
        self.call(node_id, "server_info", json!({})).await
    }

    pub async fn server_definitions(&self, node_id: usize) -> Option<Value> {
        self.call(node_id, "server_definitions", json!({})).await
    }

    pub async fn peers(&self, node_id: usize) -> Option<Vec<Value>> {
        let result = self.call(node_id, "peers", json!({})).await?;
        result.get("peers")?.as_array().cloned()
    }

    pub async fn ping(&self, node_id: usize) -> Option<Value> {
        self.call(node_id, "ping", json!({})).await
    }

    pub async fn ledger(
        &self,
        node_id: usize,
        ledger_index: Value,
        transactions: bool,
    ) -> Option<Value> {
        self.call(
            node_id,
            "ledger",
            json!({
                "ledger_index": ledger_index,
                "transactions": transactions,
                "expand": transactions,
            }),
        )
        .await
    }

    /// Returns whether the node acknowledged the change.
    pub async fn log_level(&self, node_id: usize, partition: &str, severity: &str) -> bool {
        let params = if partition == "base" {
            json!({ "severity": severity })
        } else {
            json!({ "partition": partition, "severity": severity })
        };
        match self.call(node_id, "log_level", params).await {
            Some(result) => result.get("status").and_then(Value::as_str) == Some("success"),
            None => false,
        }
    }

    /// Privileged transaction injection; only meaningful on the primary
    /// node. The raw result is returned so callers can surface engine
    /// errors verbatim.
    pub async fn inject(&self, node_id: usize, tx_blob: &str) -> Value {
        match self
            .call(node_id, "inject", json!({ "tx_blob": tx_blob }))
            .await
        {
            Some(result) => result,
            None => json!({ "error": "rpc call failed" }),
        }
    }

    /// One monitor-table row's worth of state for a node.
    pub async fn node_data(&self, node_id: usize, tracked_amendment: Option<&str>) -> NodeData {
        let started = Instant::now();
        let server_info = self.server_info(node_id).await;
        let amendment = match (tracked_amendment, &server_info) {
            (Some(amendment_id), Some(_)) => {
                let definitions = self.server_definitions(node_id).await;
                Some(amendment_status(definitions.as_ref(), amendment_id))
            }
            _ => None,
        };
        NodeData {
            node_id,
            server_info,
            amendment,
            response_time: started.elapsed(),
        }
    }
}

/// The validated ledger sequence from a `server_info` result.
pub fn validated_seq(server_info: &Value) -> Option<u64> {
    server_info
        .get("info")?
        .get("validated_ledger")?
        .get("seq")?
        .as_u64()
}

fn amendment_status(definitions: Option<&Value>, amendment_id: &str) -> AmendmentStatus {
    let definitions = match definitions {
        Some(d) => d,
        None => return AmendmentStatus::NotSynced,
    };
    if definitions.get("error").is_some() {
        return AmendmentStatus::NotSynced;
    }
    let features = match definitions.get("features").and_then(Value::as_object) {
        Some(f) => f,
        None => return AmendmentStatus::NotFound,
    };
    let wanted = amendment_id.to_uppercase();
    match features.get(&wanted) {
        Some(feature) => {
            if feature.get("enabled").and_then(Value::as_bool) == Some(true) {
                AmendmentStatus::Enabled
            } else {
                AmendmentStatus::Disabled
            }
        }
        None => AmendmentStatus::NotFound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validated_seq_extraction() {
        let info = json!({ "info": { "validated_ledger": { "seq": 17 } } });
        assert_eq!(validated_seq(&info), Some(17));
        assert_eq!(validated_seq(&json!({ "info": {} })), None);
        assert_eq!(validated_seq(&json!({})), None);
    }

    #[test]
    fn test_amendment_status_mapping() {
        let id = "abc123";
        assert_eq!(amendment_status(None, id), AmendmentStatus::NotSynced);
        assert_eq!(
            amendment_status(Some(&json!({ "error": "noNetwork" })), id),
            AmendmentStatus::NotSynced
        );
        assert_eq!(
            amendment_status(Some(&json!({ "features": {} })), id),
            AmendmentStatus::NotFound
        );
        let defs = json!({ "features": { "ABC123": { "enabled": true } } });
        assert_eq!(amendment_status(Some(&defs), id), AmendmentStatus::Enabled);
        let defs = json!({ "features": { "ABC123": { "enabled": false } } });
        assert_eq!(amendment_status(Some(&defs), id), AmendmentStatus::Disabled);
    }
}
