//! Live network monitoring.
//!
//! The monitor moves through three phases. It first waits for any node
//! to accept an event-stream connection, then polls `server_info`
//! across the cluster until consensus produces its first ledger, and
//! from there rides the push-based ledger-close stream, falling back to
//! a poll whenever a close window times out. A `watch` channel makes it
//! cancellable at every await point.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::NetworkConfig;
use crate::rpc::{validated_seq, NodeData, RpcClient};
use crate::stream::EventStreamClient;

pub const POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Consecutive empty close windows before the target index is resynced
/// from RPC.
pub const RESYNC_AFTER_MISSES: u32 = 3;
/// Consecutive empty close windows before the network is reported
/// stalled.
pub const STALL_AFTER_MISSES: u32 = 5;
/// The genesis ledger; real progress means a validated seq above this.
pub const GENESIS_LEDGER_INDEX: u64 = 1;

const ROLLING_WINDOW: usize = 10;

/// Rolling and cumulative per-ledger statistics.
#[derive(Debug, Default)]
struct LedgerStats {
    ledgers: u64,
    convergence_sum: f64,
    convergence_count: u64,
    convergence_recent: VecDeque<f64>,
    txn_total: u64,
    txn_recent: VecDeque<u64>,
    txn_by_type: HashMap<String, u64>,
    stalls: u32,
}

impl LedgerStats {
    fn record_close(&mut self, convergence: Option<f64>, txn_count: u64) {
        self.ledgers += 1;
        if let Some(convergence) = convergence {
            self.convergence_sum += convergence;
            self.convergence_count += 1;
            if self.convergence_recent.len() == ROLLING_WINDOW {
                self.convergence_recent.pop_front();
            }
            self.convergence_recent.push_back(convergence);
        }
        self.txn_total += txn_count;
        if self.txn_recent.len() == ROLLING_WINDOW {
            self.txn_recent.pop_front();
        }
        self.txn_recent.push_back(txn_count);
    }

    fn record_txn_types(&mut self, counts: HashMap<String, u64>) {
        for (txn_type, count) in counts {
            *self.txn_by_type.entry(txn_type).or_insert(0) += count;
        }
    }

    fn avg_convergence(&self) -> Option<f64> {
        if self.convergence_count == 0 {
            return None;
        }
        Some(self.convergence_sum / self.convergence_count as f64)
    }

    fn recent_convergence(&self) -> Option<f64> {
        if self.convergence_recent.is_empty() {
            return None;
        }
        Some(
            self.convergence_recent.iter().sum::<f64>()
                / self.convergence_recent.len() as f64,
        )
    }
}

pub struct NetworkMonitor {
    rpc: RpcClient,
    stream: EventStreamClient,
    config: NetworkConfig,
    tracked_amendment: Option<String>,
    started: Instant,
    stats: LedgerStats,
}

impl NetworkMonitor {
    pub fn new(
        rpc: RpcClient,
        stream: EventStreamClient,
        config: NetworkConfig,
        tracked_amendment: Option<String>,
    ) -> Self {
        Self {
            rpc,
            stream,
            config,
            tracked_amendment,
            started: Instant::now(),
            stats: LedgerStats::default(),
        }
    }

    /// Run until the shutdown signal fires.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> color_eyre::Result<()> {
        self.started = Instant::now();

        // Phase 1: wait for the cluster to accept connections at all.
        info!("waiting for node 0 to accept event-stream connections");
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            if self.stream.check_connection(0).await {
                break;
            }
            tokio::select! {
                _ = sleep(CONNECT_RETRY_DELAY) => {}
                _ = shutdown.changed() => return Ok(()),
            }
        }

        // Phase 2: poll until consensus produces its first ledger.
        info!("connected; polling every {POLL_INTERVAL:?} until the first ledger closes");
        let mut last_index;
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let data = self.fetch_all().await;
            self.render(&data, &BTreeMap::new());
            if let Some(index) = breakout_index(&data) {
                last_index = index;
                break;
            }
            tokio::select! {
                _ = sleep(POLL_INTERVAL) => {}
                _ = shutdown.changed() => return Ok(()),
            }
        }
        info!(ledger_index = last_index, "first ledger close detected, switching to events");

        // Phase 3: event-driven, with a polling fallback per timeout.
        let mut misses: u32 = 0;
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let target = last_index + 1;
            let events = tokio::select! {
                events = self
                    .stream
                    .wait_for_all(self.config.node_count, target, EVENT_TIMEOUT) => events,
                _ = shutdown.changed() => return Ok(()),
            };

            if events.is_empty() {
                misses += 1;
                warn!(target, misses, "no ledger close within {EVENT_TIMEOUT:?}");
                // Refresh the table from RPC, but keep waiting for the
                // same target.
                let data = self.fetch_all().await;
                self.render(&data, &events);
                if misses >= RESYNC_AFTER_MISSES {
                    if let Some(info) = self.rpc.server_info(0).await {
                        if let Some(seq) = validated_seq(&info) {
                            if seq != last_index {
                                info!(from = last_index, to = seq, "resyncing target from rpc");
                                last_index = seq;
                                misses = 0;
                            }
                        }
                    }
                }
                if misses >= STALL_AFTER_MISSES {
                    self.stats.stalls += 1;
                    error!(
                        misses,
                        "network appears stalled, continuing to watch for recovery"
                    );
                    misses = 0;
                }
                continue;
            }

            misses = 0;
            last_index = next_ledger_target(last_index, &events);
            let convergence = events
                .values()
                .filter_map(|e| e.get("converge_time_s").and_then(Value::as_f64))
                .next();
            let txn_count = events
                .values()
                .filter_map(|e| e.get("txn_count").and_then(Value::as_u64))
                .max()
                .unwrap_or(0);
            self.stats.record_close(convergence, txn_count);
            if txn_count > 0 {
                let counts = self.ledger_txn_types(last_index).await;
                self.stats.record_txn_types(counts);
            }

            let data = self.fetch_all().await;
            self.render(&data, &events);
        }
    }

    async fn fetch_all(&self) -> Vec<NodeData> {
        let tracked = self.tracked_amendment.as_deref();
        let fetches = (0..self.config.node_count).map(|node_id| {
            let rpc = self.rpc.clone();
            async move { rpc.node_data(node_id, tracked).await }
        });
        futures::future::join_all(fetches).await
    }

    /// Transaction-type histogram for one closed ledger, from the
    /// primary node.
    async fn ledger_txn_types(&self, ledger_index: u64) -> HashMap<String, u64> {
        let mut counts = HashMap::new();
        let ledger = match self.rpc.ledger(0, ledger_index.into(), true).await {
            Some(ledger) => ledger,
            None => return counts,
        };
        let transactions = ledger
            .get("ledger")
            .and_then(|l| l.get("transactions"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for txn in transactions {
            let txn_type = txn
                .get("TransactionType")
                .and_then(Value::as_str)
                .unwrap_or("Unknown")
                .to_string();
            *counts.entry(txn_type).or_insert(0) += 1;
        }
        counts
    }

    fn render(&self, data: &[NodeData], events: &BTreeMap<usize, Value>) {
        println!();
        println!(
            "{:<5} {:<14} {:>9} {:<10} {:>5} {:>6} {:>6} {:>7} {:>6} {:>6} {:>8}",
            "node", "state", "seq", "hash", "txns", "peers", "props", "quorum", "conv", "amend", "rt"
        );
        for node in data {
            let info = node.server_info.as_ref().and_then(|v| v.get("info"));
            let state = info
                .and_then(|i| i.get("server_state"))
                .and_then(Value::as_str)
                .unwrap_or("down");
            let seq = node
                .server_info
                .as_ref()
                .and_then(validated_seq)
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".into());
            let hash = info
                .and_then(|i| i.get("validated_ledger"))
                .and_then(|l| l.get("hash"))
                .and_then(Value::as_str)
                .map(|h| h.chars().take(8).collect::<String>())
                .unwrap_or_else(|| "-".into());
            let txns = events
                .get(&node.node_id)
                .and_then(|e| e.get("txn_count"))
                .and_then(Value::as_u64)
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".into());
            let peers = info
                .and_then(|i| i.get("peers"))
                .and_then(Value::as_u64)
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".into());
            let last_close = info.and_then(|i| i.get("last_close"));
            let proposers = last_close
                .and_then(|c| c.get("proposers"))
                .and_then(Value::as_u64)
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".into());
            let quorum = info
                .and_then(|i| i.get("validation_quorum"))
                .and_then(Value::as_u64)
                .map(|q| q.to_string())
                .unwrap_or_else(|| "-".into());
            let convergence = last_close
                .and_then(|c| c.get("converge_time_s"))
                .and_then(Value::as_f64)
                .map(|c| format!("{c:.1}s"))
                .unwrap_or_else(|| "-".into());
            let amendment = node
                .amendment
                .map(|a| a.symbol())
                .unwrap_or("-");
            println!(
                "{:<5} {:<14} {:>9} {:<10} {:>5} {:>6} {:>6} {:>7} {:>6} {:>6} {:>7}ms",
                node.node_id,
                state,
                seq,
                hash,
                txns,
                peers,
                proposers,
                quorum,
                convergence,
                amendment,
                node.response_time.as_millis(),
            );
        }
        self.render_rollups();
    }

    fn render_rollups(&self) {
        let mut line = format!(
            "uptime {} | ledgers {}",
            format_uptime(self.started.elapsed()),
            self.stats.ledgers
        );
        if let (Some(avg), Some(recent)) =
            (self.stats.avg_convergence(), self.stats.recent_convergence())
        {
            line.push_str(&format!(" | conv avg {avg:.1}s last{ROLLING_WINDOW} {recent:.1}s"));
        }
        let recent_txns: u64 = self.stats.txn_recent.iter().sum();
        line.push_str(&format!(
            " | txns {} last{ROLLING_WINDOW} {recent_txns}",
            self.stats.txn_total
        ));
        if self.stats.stalls > 0 {
            line.push_str(&format!(" | stalls {}", self.stats.stalls));
        }
        println!("{line}");
        if !self.stats.txn_by_type.is_empty() {
            let mut by_type: Vec<(&String, &u64)> = self.stats.txn_by_type.iter().collect();
            by_type.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
            let summary = by_type
                .iter()
                .map(|(txn_type, count)| format!("{txn_type}:{count}"))
                .collect::<Vec<_>>()
                .join(" ");
            println!("txn types: {summary}");
        }
    }
}

/// The ledger index that ends the polling phase: the highest validated
/// seq across the cluster, once any node is past genesis.
fn breakout_index(data: &[NodeData]) -> Option<u64> {
    data.iter()
        .filter_map(|node| node.server_info.as_ref().and_then(validated_seq))
        .max()
        .filter(|&seq| seq > GENESIS_LEDGER_INDEX)
}

/// The last seen index after a close window. An empty window keeps the
/// previous index, so the next wait retries the same target.
fn next_ledger_target(last_index: u64, events: &BTreeMap<usize, Value>) -> u64 {
    events
        .values()
        .filter_map(|event| event.get("ledger_index").and_then(Value::as_u64))
        .max()
        .unwrap_or(last_index)
}

fn format_uptime(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node_with_seq(node_id: usize, seq: Option<u64>) -> NodeData {
        NodeData {
            node_id,
            server_info: seq.map(|s| json!({ "info": { "validated_ledger": { "seq": s } } })),
            ..NodeData::default()
        }
    }

    #[test]
    fn test_no_breakout_before_consensus_starts() {
        // Nodes sitting on the genesis ledger are not progress.
        let data = vec![
            node_with_seq(0, Some(1)),
            node_with_seq(1, Some(1)),
            node_with_seq(2, None),
        ];
        assert_eq!(breakout_index(&data), None);
        assert_eq!(breakout_index(&[]), None);
    }

    #[test]
    fn test_breakout_on_any_node_past_genesis() {
        let data = vec![
            node_with_seq(0, Some(1)),
            node_with_seq(1, Some(3)),
            node_with_seq(2, Some(2)),
        ];
        assert_eq!(breakout_index(&data), Some(3));
    }

    #[test]
    fn test_empty_close_window_does_not_advance_target() {
        assert_eq!(next_ledger_target(7, &BTreeMap::new()), 7);
    }

    #[test]
    fn test_close_window_advances_to_highest_reported() {
        let mut events = BTreeMap::new();
        events.insert(0, json!({ "type": "ledgerClosed", "ledger_index": 8 }));
        events.insert(2, json!({ "type": "ledgerClosed", "ledger_index": 9 }));
        assert_eq!(next_ledger_target(7, &events), 9);
    }

    #[test]
    fn test_rolling_stats_window() {
        let mut stats = LedgerStats::default();
        for i in 0..15 {
            stats.record_close(Some(2.0), i);
        }
        assert_eq!(stats.ledgers, 15);
        assert_eq!(stats.convergence_recent.len(), ROLLING_WINDOW);
        assert_eq!(stats.txn_recent.len(), ROLLING_WINDOW);
        assert_eq!(stats.txn_total, (0..15).sum::<u64>());
        assert_eq!(stats.recent_convergence(), Some(2.0));
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(Duration::from_secs(0)), "00:00:00");
        assert_eq!(format_uptime(Duration::from_secs(3 * 3600 + 21 * 60 + 9)), "03:21:09");
    }
}
