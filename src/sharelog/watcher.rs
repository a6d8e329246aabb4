//! Live sharelog watcher
//!
//! One poll cycle lists the tracked rounds, tails every sharelog in round
//! then file order and hands back at most `max_lines_per_tick` lines. Lines
//! read past the budget wait in a per-file backlog, and the next cycle
//! resumes at the file where the budget ran out.

use super::discovery::{round_of, RoundDiscovery};
use super::tailer::{FileTailer, TailLine};
use crate::types::LineOrigin;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Settings for live tailing
#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub logs_dir: PathBuf,
    pub suffix: String,
    pub track_last_rounds: usize,
    pub max_lines_per_tick: usize,
    pub fresh_file_grace: Duration,
}

/// A raw line together with where it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailedLine {
    pub line: String,
    pub round: String,
    pub path: PathBuf,
    pub inode: u64,
    /// Offset just past the line's terminator
    pub end: u64,
}

impl TailedLine {
    fn new(line: TailLine, round: &str, path: &Path) -> Self {
        Self {
            line: line.text,
            round: round.to_string(),
            path: path.to_path_buf(),
            inode: line.inode,
            end: line.end,
        }
    }

    pub fn origin(&self) -> LineOrigin {
        LineOrigin {
            path: self.path.clone(),
            inode: self.inode,
            end: self.end,
        }
    }
}

/// Owns the tail state of every live-tracked sharelog
///
/// Tail state is only forgotten when the tailer fails to stat a file or when
/// its round leaves the tracked set. A file missing from one listing keeps
/// its offset.
#[derive(Debug)]
pub struct ShareLogWatcher {
    discovery: RoundDiscovery,
    tailer: FileTailer,
    track_last_rounds: usize,
    max_lines_per_tick: usize,
    tracked: Vec<String>,
    backlog: HashMap<PathBuf, VecDeque<TailLine>>,
    /// First file of the next cycle after the budget ran out
    resume: Option<PathBuf>,
}

impl ShareLogWatcher {
    pub fn new(settings: WatcherSettings) -> Self {
        Self {
            discovery: RoundDiscovery::new(settings.logs_dir, settings.suffix),
            tailer: FileTailer::new(settings.fresh_file_grace),
            track_last_rounds: settings.track_last_rounds,
            max_lines_per_tick: settings.max_lines_per_tick,
            tracked: Vec::new(),
            backlog: HashMap::new(),
            resume: None,
        }
    }

    /// Rounds seen by the last cycle, ascending
    pub fn tracked_rounds(&self) -> &[String] {
        &self.tracked
    }

    /// Files with tail state
    pub fn tracked_files(&self) -> usize {
        self.tailer.tracked_files()
    }

    /// Lines read but not yet handed out
    pub fn backlog_len(&self) -> usize {
        self.backlog.values().map(VecDeque::len).sum()
    }

    /// Run one poll cycle
    pub async fn tick(&mut self) -> Vec<TailedLine> {
        let rounds = self.discovery.recent_rounds(self.track_last_rounds).await;
        if rounds != self.tracked {
            self.retrack(rounds);
        }

        let mut files = Vec::new();
        for round in &self.tracked {
            for path in self.discovery.list_files(round).await {
                files.push((round.clone(), path));
            }
        }
        let start = self
            .resume
            .take()
            .and_then(|resume| files.iter().position(|(_, path)| *path == resume))
            .unwrap_or(0);
        files.rotate_left(start);

        let mut budget = self.max_lines_per_tick;
        let mut out = Vec::new();

        for (round, path) in files {
            if budget == 0 {
                self.resume = Some(path);
                break;
            }

            if let Some(pending) = self.backlog.get_mut(&path) {
                let take = pending.len().min(budget);
                out.extend(pending.drain(..take).map(|line| TailedLine::new(line, &round, &path)));
                budget -= take;
                if !pending.is_empty() {
                    // Keep per-file order: no fresh reads behind a backlog
                    continue;
                }
                self.backlog.remove(&path);
                if budget == 0 {
                    continue;
                }
            }

            let mut lines = self.tailer.read_new_lines(&path).await;
            if lines.len() > budget {
                let rest: VecDeque<TailLine> = lines.split_off(budget).into();
                debug!(file = %path.display(), deferred = rest.len(), "Line budget reached, deferring");
                self.backlog.insert(path.clone(), rest);
            }
            budget -= lines.len();
            out.extend(lines.into_iter().map(|line| TailedLine::new(line, &round, &path)));
        }

        out
    }

    fn retrack(&mut self, rounds: Vec<String>) {
        info!(
            rounds = ?rounds,
            previous = self.tracked.len(),
            "Tracked rounds changed"
        );
        let keep: HashSet<&str> = rounds.iter().map(String::as_str).collect();
        let in_tracked = |p: &Path| round_of(p).is_some_and(|r| keep.contains(r.as_str()));
        self.tailer.retain(in_tracked);
        self.backlog.retain(|p, _| in_tracked(p.as_path()));
        self.tracked = rounds;
    }
}
