//! Timestamp-ordered merge of per-node debug logs.
//!
//! Node logs are merged with a k-way heap merge: at most one buffered
//! line per file, so memory stays proportional to the node count, not
//! the log size. Lines without a leading timestamp are continuation
//! lines (stack traces, wrapped JSON) and are skipped.

use std::cmp::Ordering;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, VecDeque};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use color_eyre::eyre::{eyre, Result, WrapErr};
use regex::Regex;

/// Node-prefixed time-only lines: `N3 12:34:56.789 ...`.
static NODE_PREFIX_TS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^N\d+\s+(\d{2}:\d{2}:\d{2}\.\d+)").expect("regex compiles")
});

/// Full-date lines: `2026-Aug-31 12:34:56.789 ...`.
static FULL_DATE_TS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4}-[A-Za-z]{3}-\d{2} \d{2}:\d{2}:\d{2}\.\d+)").expect("regex compiles")
});

/// Time-only timestamps get anchored to a fixed date so both format
/// families order correctly within themselves.
const ANCHOR_DATE: (i32, u32, u32) = (1900, 1, 1);

fn anchor_date() -> NaiveDate {
    let (y, m, d) = ANCHOR_DATE;
    NaiveDate::from_ymd_opt(y, m, d).unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: NaiveDateTime,
    pub node_id: usize,
    pub line: String,
}

/// One log file to feed into the merge.
#[derive(Debug, Clone)]
pub struct NodeLog {
    pub node_id: usize,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LogFilter {
    pub pattern: Regex,
    /// Keep only the last N matching lines of each file.
    pub tail: Option<usize>,
    pub since: Option<NaiveDateTime>,
    pub until: Option<NaiveDateTime>,
}

impl Default for LogFilter {
    fn default() -> Self {
        Self {
            pattern: Regex::new("").expect("regex compiles"),
            tail: None,
            since: None,
            until: None,
        }
    }
}

impl LogFilter {
    fn matches(&self, line: &str, timestamp: NaiveDateTime) -> bool {
        if !self.pattern.is_match(line) {
            return false;
        }
        if let Some(since) = self.since {
            if timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if timestamp > until {
                return false;
            }
        }
        true
    }
}

/// Parse the leading timestamp of a log line. `None` marks a
/// continuation line.
pub fn parse_timestamp(line: &str) -> Option<NaiveDateTime> {
    if let Some(captures) = NODE_PREFIX_TS.captures(line) {
        let time = NaiveTime::parse_from_str(&captures[1], "%H:%M:%S%.f").ok()?;
        return Some(anchor_date().and_time(time));
    }
    if let Some(captures) = FULL_DATE_TS.captures(line) {
        return NaiveDateTime::parse_from_str(&captures[1], "%Y-%b-%d %H:%M:%S%.f").ok();
    }
    None
}

/// Parse a user-supplied window bound: either a full
/// `YYYY-MM-DD HH:MM:SS[.f]` or a bare `HH:MM:SS[.f]` anchored to the
/// same date as time-only log lines.
pub fn parse_window_bound(value: &str) -> Result<NaiveDateTime> {
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(parsed);
        }
    }
    for format in ["%H:%M:%S%.f", "%H:%M:%S"] {
        if let Ok(time) = NaiveTime::parse_from_str(value, format) {
            return Ok(anchor_date().and_time(time));
        }
    }
    Err(eyre!(
        "unrecognized timestamp '{value}'\nhint: use 'HH:MM:SS' or 'YYYY-MM-DD HH:MM:SS'"
    ))
}

/// Parse a node subset spec such as `0-2,5` into node ids.
pub fn parse_node_spec(spec: &str) -> Result<BTreeSet<usize>> {
    let mut nodes = BTreeSet::new();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((start, end)) = part.split_once('-') {
            let start: usize = start
                .trim()
                .parse()
                .map_err(|_| eyre!("bad node range '{part}' in '{spec}'"))?;
            let end: usize = end
                .trim()
                .parse()
                .map_err(|_| eyre!("bad node range '{part}' in '{spec}'"))?;
            if end < start {
                return Err(eyre!("bad node range '{part}' in '{spec}'"));
            }
            nodes.extend(start..=end);
        } else {
            let id: usize = part
                .parse()
                .map_err(|_| eyre!("bad node id '{part}' in '{spec}'"))?;
            nodes.insert(id);
        }
    }
    Ok(nodes)
}

/// Discover `n<id>/debug.log` files under the base directory,
/// optionally restricted to a node subset.
pub fn collect_log_files(
    base_dir: &Path,
    nodes: Option<&BTreeSet<usize>>,
) -> Result<Vec<NodeLog>> {
    let mut files = Vec::new();
    let entries = std::fs::read_dir(base_dir)
        .wrap_err_with(|| format!("failed to read {}", base_dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let node_id: usize = match name.strip_prefix('n').and_then(|id| id.parse().ok()) {
            Some(id) => id,
            None => continue,
        };
        if let Some(subset) = nodes {
            if !subset.contains(&node_id) {
                continue;
            }
        }
        let path = entry.path().join("debug.log");
        if path.is_file() {
            files.push(NodeLog { node_id, path });
        }
    }
    files.sort_by_key(|f| f.node_id);
    Ok(files)
}

fn file_entries(
    log: &NodeLog,
    filter: &LogFilter,
) -> Result<Box<dyn Iterator<Item = LogEntry>>> {
    let file = File::open(&log.path)
        .wrap_err_with(|| format!("failed to open {}", log.path.display()))?;
    let node_id = log.node_id;
    let tail = filter.tail;
    let filter = filter.clone();
    let entries = BufReader::new(file).lines().filter_map(move |line| {
        let line = line.ok()?;
        let timestamp = parse_timestamp(&line)?;
        if !filter.matches(&line, timestamp) {
            return None;
        }
        Some(LogEntry {
            timestamp,
            node_id,
            line,
        })
    });
    match tail {
        Some(n) => {
            // Bounded window over the stream, so tail never holds the
            // whole file.
            let mut window: VecDeque<LogEntry> = VecDeque::with_capacity(n);
            for entry in entries {
                if window.len() == n {
                    window.pop_front();
                }
                window.push_back(entry);
            }
            Ok(Box::new(window.into_iter()))
        }
        None => Ok(Box::new(entries)),
    }
}

struct HeapEntry {
    source: usize,
    entry: LogEntry,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Ties break on source index so equal timestamps emit in a
        // stable file order.
        (self.entry.timestamp, self.source).cmp(&(other.entry.timestamp, other.source))
    }
}

/// K-way merge over per-file iterators, globally ordered by
/// (timestamp, source file).
pub struct LogMerger {
    sources: Vec<Box<dyn Iterator<Item = LogEntry>>>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    high_water: usize,
}

impl LogMerger {
    pub fn new(files: &[NodeLog], filter: &LogFilter) -> Result<Self> {
        let mut sources = Vec::with_capacity(files.len());
        let mut heap = BinaryHeap::with_capacity(files.len());
        for (source, log) in files.iter().enumerate() {
            let mut entries = file_entries(log, filter)?;
            if let Some(entry) = entries.next() {
                heap.push(Reverse(HeapEntry { source, entry }));
            }
            sources.push(entries);
        }
        let high_water = heap.len();
        Ok(Self {
            sources,
            heap,
            high_water,
        })
    }

    /// Largest number of entries ever buffered at once; bounded by the
    /// number of source files.
    pub fn buffered_high_water(&self) -> usize {
        self.high_water
    }
}

impl Iterator for LogMerger {
    type Item = LogEntry;

    fn next(&mut self) -> Option<LogEntry> {
        let Reverse(HeapEntry { source, entry }) = self.heap.pop()?;
        if let Some(next) = self.sources[source].next() {
            self.heap.push(Reverse(HeapEntry {
                source,
                entry: next,
            }));
            self.high_water = self.high_water.max(self.heap.len());
        }
        Some(entry)
    }
}

/// Unsorted fast path: stream each file to completion in turn.
pub fn unsorted(
    files: &[NodeLog],
    filter: &LogFilter,
) -> Result<impl Iterator<Item = LogEntry>> {
    let mut sources = Vec::with_capacity(files.len());
    for log in files {
        sources.push(file_entries(log, filter)?);
    }
    Ok(sources.into_iter().flatten())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_log(dir: &TempDir, node_id: usize, lines: &[&str]) -> NodeLog {
        let node_dir = dir.path().join(format!("n{node_id}"));
        std::fs::create_dir_all(&node_dir).unwrap();
        let path = node_dir.join("debug.log");
        let mut file = File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        NodeLog { node_id, path }
    }

    #[test]
    fn test_parse_both_timestamp_formats() {
        let node_prefixed = parse_timestamp("N2 10:20:30.500000 Peer connected").unwrap();
        assert_eq!(node_prefixed.time(), NaiveTime::from_hms_micro_opt(10, 20, 30, 500_000).unwrap());
        let full = parse_timestamp("2026-Aug-31 10:20:30.500 LedgerConsensus:NFO done").unwrap();
        assert_eq!(full.date(), NaiveDate::from_ymd_opt(2026, 8, 31).unwrap());
        assert!(parse_timestamp("    at consensus.cpp:412").is_none());
        assert!(parse_timestamp("").is_none());
    }

    #[test]
    fn test_merge_orders_globally_across_files() {
        let dir = TempDir::new().unwrap();
        let a = write_log(&dir, 0, &["N0 10:00:01.0 first", "N0 10:00:04.0 fourth"]);
        let b = write_log(&dir, 1, &["N1 10:00:02.0 second", "N1 10:00:03.0 third"]);
        let merged: Vec<LogEntry> =
            LogMerger::new(&[a, b], &LogFilter::default()).unwrap().collect();
        let words: Vec<&str> = merged
            .iter()
            .map(|e| e.line.rsplit(' ').next().unwrap())
            .collect();
        assert_eq!(words, vec!["first", "second", "third", "fourth"]);
    }

    #[test]
    fn test_merge_buffers_at_most_one_line_per_file() {
        let dir = TempDir::new().unwrap();
        let files: Vec<NodeLog> = (0..4)
            .map(|id| {
                let lines: Vec<String> = (0..50)
                    .map(|i| format!("N{id} 10:{:02}:{:02}.{id} message", i / 60, i % 60))
                    .collect();
                let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
                write_log(&dir, id, &refs)
            })
            .collect();
        let mut merger = LogMerger::new(&files, &LogFilter::default()).unwrap();
        let total = merger.by_ref().count();
        assert_eq!(total, 200);
        assert!(merger.buffered_high_water() <= 4);
    }

    #[test]
    fn test_continuation_lines_never_emitted() {
        let dir = TempDir::new().unwrap();
        let log = write_log(
            &dir,
            0,
            &[
                "N0 10:00:01.0 exception thrown",
                "    at consensus.cpp:412",
                "    at peer.cpp:98",
                "N0 10:00:02.0 recovered",
            ],
        );
        let merged: Vec<LogEntry> =
            LogMerger::new(&[log], &LogFilter::default()).unwrap().collect();
        assert_eq!(merged.len(), 2);
        assert!(merged.iter().all(|e| e.line.starts_with("N0 ")));
    }

    #[test]
    fn test_pattern_and_tail_filters() {
        let dir = TempDir::new().unwrap();
        let log = write_log(
            &dir,
            0,
            &[
                "N0 10:00:01.0 Peer connected",
                "N0 10:00:02.0 LedgerConsensus done",
                "N0 10:00:03.0 Peer dropped",
                "N0 10:00:04.0 Peer connected",
            ],
        );
        let filter = LogFilter {
            pattern: Regex::new("Peer").unwrap(),
            tail: Some(2),
            ..LogFilter::default()
        };
        let merged: Vec<LogEntry> = LogMerger::new(&[log], &filter).unwrap().collect();
        assert_eq!(merged.len(), 2);
        assert!(merged[0].line.contains("dropped"));
        assert!(merged[1].line.ends_with("connected"));
    }

    #[test]
    fn test_time_window_filter() {
        let dir = TempDir::new().unwrap();
        let log = write_log(
            &dir,
            0,
            &[
                "N0 10:00:01.0 early",
                "N0 10:00:05.0 inside",
                "N0 10:00:09.0 late",
            ],
        );
        let filter = LogFilter {
            since: Some(parse_window_bound("10:00:02").unwrap()),
            until: Some(parse_window_bound("10:00:08").unwrap()),
            ..LogFilter::default()
        };
        let merged: Vec<LogEntry> = LogMerger::new(&[log], &filter).unwrap().collect();
        assert_eq!(merged.len(), 1);
        assert!(merged[0].line.ends_with("inside"));
    }

    #[test]
    fn test_unsorted_streams_files_independently() {
        let dir = TempDir::new().unwrap();
        let a = write_log(&dir, 0, &["N0 10:00:05.0 a-late"]);
        let b = write_log(&dir, 1, &["N1 10:00:01.0 b-early"]);
        let entries: Vec<LogEntry> =
            unsorted(&[a, b], &LogFilter::default()).unwrap().collect();
        // File order, not timestamp order.
        assert_eq!(entries[0].node_id, 0);
        assert_eq!(entries[1].node_id, 1);
    }

    #[test]
    fn test_parse_node_spec() {
        let nodes = parse_node_spec("0-2,5").unwrap();
        assert_eq!(nodes.into_iter().collect::<Vec<_>>(), vec![0, 1, 2, 5]);
        assert_eq!(parse_node_spec("3").unwrap().len(), 1);
        assert!(parse_node_spec("2-1").is_err());
        assert!(parse_node_spec("x").is_err());
    }

    #[test]
    fn test_collect_log_files_filters_subset() {
        let dir = TempDir::new().unwrap();
        for id in 0..3 {
            write_log(&dir, id, &["N0 10:00:00.0 hello"]);
        }
        std::fs::create_dir_all(dir.path().join("not-a-node")).unwrap();
        let all = collect_log_files(dir.path(), None).unwrap();
        assert_eq!(all.len(), 3);
        let subset: BTreeSet<usize> = [0, 2].into_iter().collect();
        let some = collect_log_files(dir.path(), Some(&subset)).unwrap();
        assert_eq!(some.len(), 2);
        assert_eq!(some[1].node_id, 2);
    }
}
