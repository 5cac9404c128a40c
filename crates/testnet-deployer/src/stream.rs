//! Ledger-close event subscriptions over websocket.
//!
//! Each node exposes `ws://127.0.0.1:{base_ws + id}`. The client
//! subscribes to the ledger stream and reads `ledgerClosed` events.
//! Connections drop routinely while nodes restart or resync, so every
//! wait reconnects with a bounded backoff inside its timeout budget.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Minimum pause between reconnect attempts inside one wait.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct EventStreamClient {
    base_port_ws: u16,
}

impl EventStreamClient {
    pub fn new(base_port_ws: u16) -> Self {
        Self { base_port_ws }
    }

    fn url(&self, node_id: usize) -> String {
        format!("ws://127.0.0.1:{}", self.base_port_ws + node_id as u16)
    }

    /// Probe whether a node's event stream accepts connections.
    pub async fn check_connection(&self, node_id: usize) -> bool {
        matches!(
            timeout(CONNECT_TIMEOUT, connect_async(self.url(node_id))).await,
            Ok(Ok(_))
        )
    }

    async fn subscribe(&self, node_id: usize) -> Option<WsStream> {
        let url = self.url(node_id);
        let (mut stream, _response) = match timeout(CONNECT_TIMEOUT, connect_async(&url)).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => {
                debug!(node_id, "websocket connect failed: {e}");
                return None;
            }
            Err(_) => {
                debug!(node_id, "websocket connect timed out");
                return None;
            }
        };
        let request = json!({ "id": 1, "command": "subscribe", "streams": ["ledger"] });
        if let Err(e) = stream.send(Message::Text(request.to_string().into())).await {
            debug!(node_id, "subscribe send failed: {e}");
            return None;
        }
        // First message is the subscribe acknowledgement.
        match stream.next().await {
            Some(Ok(Message::Text(ack))) => {
                let ack: Value = serde_json::from_str(&ack).unwrap_or(Value::Null);
                if ack.get("error").is_some() {
                    debug!(node_id, "subscribe rejected: {ack}");
                    return None;
                }
            }
            other => {
                debug!(node_id, "no subscribe acknowledgement: {other:?}");
                return None;
            }
        }
        Some(stream)
    }

    /// Read one subscription until a `ledgerClosed` event at or past
    /// `target` arrives or the stream drops.
    async fn watch_once(&self, node_id: usize, target: u64) -> Option<Value> {
        let mut stream = self.subscribe(node_id).await?;
        while let Some(message) = stream.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text,
                Ok(_) => continue,
                Err(e) => {
                    debug!(node_id, "websocket read failed: {e}");
                    return None;
                }
            };
            let event: Value = match serde_json::from_str(&text) {
                Ok(event) => event,
                Err(_) => continue,
            };
            if event.get("type").and_then(Value::as_str) != Some("ledgerClosed") {
                continue;
            }
            match event.get("ledger_index").and_then(Value::as_u64) {
                Some(index) if index >= target => return Some(event),
                _ => continue,
            }
        }
        None
    }

    /// Wait until `node_id` reports a ledger close with index >=
    /// `target`, reconnecting as needed. `None` means the deadline
    /// passed first.
    pub async fn wait_for_ledger_close(
        &self,
        node_id: usize,
        target: u64,
        wait: Duration,
    ) -> Option<Value> {
        let deadline = Instant::now() + wait;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            match timeout(deadline - now, self.watch_once(node_id, target)).await {
                Ok(Some(event)) => return Some(event),
                Ok(None) => {} // connection failed or dropped; retry
                Err(_) => return None,
            }
            if Instant::now() + RECONNECT_DELAY >= deadline {
                return None;
            }
            sleep(RECONNECT_DELAY).await;
        }
    }

    /// Wait for a ledger close at or past `target` from every node,
    /// collecting whichever respond within the timeout.
    pub async fn wait_for_all(
        &self,
        node_count: usize,
        target: u64,
        wait: Duration,
    ) -> BTreeMap<usize, Value> {
        let waits = (0..node_count).map(|node_id| {
            let client = self.clone();
            async move {
                (
                    node_id,
                    client.wait_for_ledger_close(node_id, target, wait).await,
                )
            }
        });
        futures::future::join_all(waits)
            .await
            .into_iter()
            .filter_map(|(node_id, event)| event.map(|e| (node_id, e)))
            .collect()
    }
}
