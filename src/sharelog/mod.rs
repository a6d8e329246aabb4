//! Sharelog ingestion
//!
//! Round and file discovery, incremental tailing, line parsing, subscription
//! matching and history replay over the on-disk sharelog tree:
//!
//! ```text
//! <logs_dir>/<8 hex digit round>/<name>.sharelog
//! ```

pub mod discovery;
pub mod history;
pub mod matcher;
pub mod parser;
pub mod tailer;
pub mod watcher;

pub use discovery::{is_round_name, RoundDiscovery};
pub use history::{HistoryReplayer, HistorySettings, ReplayCoverage, ReplaySummary};
pub use matcher::share_matches;
pub use parser::{parse_createdate, parse_share_line, split_workername};
pub use tailer::{FileTailer, TailLine};
pub use watcher::{ShareLogWatcher, TailedLine, WatcherSettings};
