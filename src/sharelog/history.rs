//! History replay
//!
//! Backfills a new subscriber from the most recently modified sharelogs
//! before it switches to live delivery. Only terminated lines are replayed,
//! and the returned [`ReplayCoverage`] records how far into each file the
//! replay read so live frames for the same bytes can be skipped.

use super::discovery::RoundDiscovery;
use super::matcher::share_matches;
use super::parser::parse_share_line_at;
use super::tailer::inode_of;
use crate::types::{EventSink, LineOrigin, StreamEvent, Subscription};
use crate::utils::system_time_secs;
use crate::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

/// Settings for history replay
#[derive(Debug, Clone)]
pub struct HistorySettings {
    pub logs_dir: PathBuf,
    pub suffix: String,
    /// Number of most recent rounds searched for candidate files
    pub scan_rounds: usize,
    /// Most recent candidate files actually read
    pub max_files: usize,
}

/// A sharelog selected for replay
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayFile {
    pub round: String,
    pub path: PathBuf,
    pub modified: f64,
}

/// Bytes of each sharelog consumed by one replay
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayCoverage {
    files: HashMap<PathBuf, (u64, u64)>,
}

impl ReplayCoverage {
    /// Record that `[0, len)` of `path` at `inode` was replayed
    pub fn record(&mut self, path: &Path, inode: u64, len: u64) {
        self.files.insert(path.to_path_buf(), (inode, len));
    }

    /// Whether the line at `origin` lies inside the replayed bytes
    pub fn covers(&self, origin: &LineOrigin) -> bool {
        self.files
            .get(&origin.path)
            .is_some_and(|&(inode, len)| inode == origin.inode && origin.end <= len)
    }

    /// Number of files read
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Result of a completed replay
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplaySummary {
    pub sent: u64,
    pub coverage: ReplayCoverage,
}

/// Bounded history scanner shared by all connections
#[derive(Debug, Clone)]
pub struct HistoryReplayer {
    discovery: RoundDiscovery,
    scan_rounds: usize,
    max_files: usize,
}

impl HistoryReplayer {
    pub fn new(settings: HistorySettings) -> Self {
        Self {
            discovery: RoundDiscovery::new(settings.logs_dir, settings.suffix),
            scan_rounds: settings.scan_rounds,
            max_files: settings.max_files,
        }
    }

    /// Sharelogs modified at or after `since`, oldest first, capped to the
    /// newest `max_files`
    ///
    /// Fails only when the logs root exists but cannot be listed.
    pub async fn find_recent_files(&self, since: f64) -> Result<Vec<ReplayFile>> {
        let rounds = self
            .discovery
            .read_recent_rounds(self.scan_rounds)
            .await
            .map_err(|e| Error::replay(format!("cannot list rounds: {}", e)))?;

        let mut candidates = Vec::new();
        for round in rounds {
            for path in self.discovery.list_files(&round).await {
                let modified = match fs::metadata(&path).await.and_then(|m| m.modified()) {
                    Ok(modified) => system_time_secs(modified),
                    Err(e) => {
                        debug!(file = %path.display(), error = %e, "Skipping unstatable sharelog");
                        continue;
                    }
                };
                if modified >= since {
                    candidates.push(ReplayFile {
                        round: round.clone(),
                        path,
                        modified,
                    });
                }
            }
        }

        // Stable: equal mtimes keep round then name order
        candidates.sort_by(|a, b| a.modified.total_cmp(&b.modified));
        let start = candidates.len().saturating_sub(self.max_files);
        candidates.drain(..start);
        Ok(candidates)
    }

    /// Stream every matching share inside the subscription's window, then the
    /// `history_end` marker
    ///
    /// Unreadable files are skipped. An unlistable logs root or a failing
    /// sink aborts the replay before `history_end`.
    pub async fn replay<S>(&self, subscription: &Subscription, now: f64, sink: &mut S) -> Result<ReplaySummary>
    where
        S: EventSink + ?Sized,
    {
        let cutoff = now - subscription.minutes * 60.0;
        let files = self.find_recent_files(cutoff).await?;
        let mut summary = ReplaySummary::default();

        for file in &files {
            let (inode, content) = match read_terminated(&file.path).await {
                Ok(read) => read,
                Err(e) => {
                    warn!(file = %file.path.display(), error = %e, "Skipping unreadable sharelog during replay");
                    continue;
                }
            };
            summary.coverage.record(&file.path, inode, content.len() as u64);

            for line in String::from_utf8_lossy(&content).split('\n') {
                let Some(mut share) = parse_share_line_at(line, now) else {
                    continue;
                };
                if share.ts < cutoff || !share_matches(&share, subscription) {
                    continue;
                }
                share.round = Some(file.round.clone());
                share.file = Some(file.path.clone());

                sink.send_event(&StreamEvent::Share {
                    replay: true,
                    share: Arc::new(share),
                })
                .await?;
                summary.sent += 1;
            }
        }

        debug!(
            address = %subscription.address,
            files = files.len(),
            sent = summary.sent,
            "History replay finished"
        );

        sink.send_event(&StreamEvent::HistoryEnd {
            sent: summary.sent,
            minutes: subscription.minutes,
        })
        .await?;

        Ok(summary)
    }
}

/// Inode and contents of a file up to and including its last line terminator
///
/// An unterminated trailing fragment is left for the live tail.
async fn read_terminated(path: &Path) -> std::io::Result<(u64, Vec<u8>)> {
    let mut file = File::open(path).await?;
    let inode = inode_of(&file.metadata().await?);
    let mut content = Vec::new();
    file.read_to_end(&mut content).await?;
    let complete = content.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    content.truncate(complete);
    Ok((inode, content))
}
