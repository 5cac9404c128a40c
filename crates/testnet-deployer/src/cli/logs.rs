use std::path::PathBuf;

use clap::Parser;
use color_eyre::Result;
use regex::Regex;
use testnet_deployer::logs::{
    collect_log_files, parse_node_spec, parse_window_bound, unsorted, LogEntry, LogFilter,
    LogMerger,
};
use tracing::info;

use super::Run;

#[derive(Debug, Parser)]
pub struct Logs {
    /// Regex applied to every log line.
    #[arg(default_value = ".")]
    pub pattern: String,

    /// Base directory of the generated network.
    #[arg(long, default_value = "testnet")]
    pub directory: PathBuf,

    /// Keep only the last N matching lines of each file.
    #[arg(long)]
    pub tail: Option<usize>,

    /// Print files one after another instead of merging by timestamp.
    #[arg(long)]
    pub no_sort: bool,

    /// Stop after printing N lines.
    #[arg(long)]
    pub limit: Option<usize>,

    /// Drop lines before this time ('HH:MM:SS' or 'YYYY-MM-DD HH:MM:SS').
    #[arg(long)]
    pub since: Option<String>,

    /// Drop lines after this time.
    #[arg(long)]
    pub until: Option<String>,

    /// Node subset, e.g. '0-2,5'.
    #[arg(long)]
    pub nodes: Option<String>,
}

impl Run for Logs {
    async fn run(self) -> Result<()> {
        let filter = LogFilter {
            pattern: Regex::new(&self.pattern)?,
            tail: self.tail,
            since: self.since.as_deref().map(parse_window_bound).transpose()?,
            until: self.until.as_deref().map(parse_window_bound).transpose()?,
        };
        let subset = self.nodes.as_deref().map(parse_node_spec).transpose()?;
        let files = collect_log_files(&self.directory, subset.as_ref())?;
        if files.is_empty() {
            info!(directory = %self.directory.display(), "no node log files found");
            return Ok(());
        }

        let limit = self.limit.unwrap_or(usize::MAX);
        let printed = if self.no_sort {
            print_entries(unsorted(&files, &filter)?.take(limit))
        } else {
            print_entries(LogMerger::new(&files, &filter)?.take(limit))
        };
        eprintln!("{printed} lines from {} files", files.len());
        Ok(())
    }
}

fn print_entries(entries: impl Iterator<Item = LogEntry>) -> usize {
    let mut printed = 0;
    for entry in entries {
        println!("[n{}] {}", entry.node_id, entry.line);
        printed += 1;
    }
    printed
}
