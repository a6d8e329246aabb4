//! Incremental file tailer
//!
//! Keeps `{offset, inode, carry}` per file and returns only the complete
//! lines appended since the previous poll. Bytes before the stored offset are
//! never read again; an unterminated trailing fragment is carried until its
//! terminator arrives.

use std::collections::HashMap;
use std::fs::Metadata;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, trace};

/// Per-file tail position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailState {
    /// Bytes consumed so far
    pub offset: u64,
    /// Inode the offset refers to
    pub inode: u64,
    /// Partial line awaiting its terminator
    pub carry: Vec<u8>,
}

/// A complete line and where it ended in its file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailLine {
    pub text: String,
    pub inode: u64,
    /// Offset just past the terminator
    pub end: u64,
}

/// Tail-state table for every observed file
#[derive(Debug)]
pub struct FileTailer {
    states: HashMap<PathBuf, TailState>,
    fresh_grace: Duration,
}

impl FileTailer {
    /// Create a tailer; files modified within `fresh_grace` of their first
    /// observation are read from their start instead of their end
    pub fn new(fresh_grace: Duration) -> Self {
        Self {
            states: HashMap::new(),
            fresh_grace,
        }
    }

    /// Stored state for a file, if it has been observed
    pub fn state(&self, path: &Path) -> Option<&TailState> {
        self.states.get(path)
    }

    /// Number of files with tail state
    pub fn tracked_files(&self) -> usize {
        self.states.len()
    }

    /// Drop state for files the predicate rejects
    pub fn retain(&mut self, mut keep: impl FnMut(&Path) -> bool) {
        self.states.retain(|path, _| keep(path));
    }

    /// Poll one file and return the complete lines appended since last time
    ///
    /// The first observation only records a starting point and returns
    /// nothing. A changed inode or a size below the stored offset is treated
    /// as rotation and restarts from byte zero.
    pub async fn read_new_lines(&mut self, path: &Path) -> Vec<TailLine> {
        let meta = match fs::metadata(path).await {
            Ok(meta) => meta,
            Err(e) => {
                if self.states.remove(path).is_some() {
                    debug!(file = %path.display(), error = %e, "Sharelog vanished, dropping tail state");
                }
                return Vec::new();
            }
        };

        let inode = inode_of(&meta);
        let size = meta.len();

        let Some(state) = self.states.get_mut(path) else {
            let offset = if is_fresh(&meta, self.fresh_grace) { 0 } else { size };
            trace!(file = %path.display(), offset, size, "Tracking new sharelog");
            self.states.insert(
                path.to_path_buf(),
                TailState {
                    offset,
                    inode,
                    carry: Vec::new(),
                },
            );
            return Vec::new();
        };

        if state.inode != inode || size < state.offset {
            debug!(
                file = %path.display(),
                old_inode = state.inode,
                new_inode = inode,
                offset = state.offset,
                size,
                "Sharelog rotated or truncated, restarting from 0"
            );
            state.offset = 0;
            state.inode = inode;
            state.carry.clear();
        }

        if size == state.offset {
            return Vec::new();
        }

        let chunk = match read_range(path, state.offset, size).await {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(file = %path.display(), error = %e, "Sharelog read failed, retrying next poll");
                return Vec::new();
            }
        };
        let start = state.offset;
        state.offset = size;

        // The carry never holds a terminator, so the n-th newline of the
        // chunk ends the n-th complete line
        let ends = chunk
            .iter()
            .enumerate()
            .filter(|(_, b)| **b == b'\n')
            .map(|(i, _)| start + i as u64 + 1);
        split_lines(&mut state.carry, &chunk)
            .into_iter()
            .zip(ends)
            .map(|(text, end)| TailLine { text, inode, end })
            .collect()
    }
}

/// Read exactly the bytes in `[start, end)`
async fn read_range(path: &Path, start: u64, end: u64) -> std::io::Result<Vec<u8>> {
    let len = usize::try_from(end - start)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "range too large"))?;
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Append `chunk` to `carry` and cut off every complete line
///
/// Lines are split on `\n` with a trailing `\r` removed; whatever follows
/// the last terminator stays in `carry`.
pub fn split_lines(carry: &mut Vec<u8>, chunk: &[u8]) -> Vec<String> {
    carry.extend_from_slice(chunk);

    let Some(last_newline) = carry.iter().rposition(|b| *b == b'\n') else {
        return Vec::new();
    };

    let complete: Vec<u8> = carry.drain(..=last_newline).collect();
    complete[..complete.len() - 1]
        .split(|b| *b == b'\n')
        .map(|line| {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            String::from_utf8_lossy(line).into_owned()
        })
        .collect()
}

fn is_fresh(meta: &Metadata, grace: Duration) -> bool {
    match meta.modified() {
        Ok(modified) => match SystemTime::now().duration_since(modified) {
            Ok(age) => age <= grace,
            // Modified "in the future": clock skew, treat as just written
            Err(_) => true,
        },
        Err(_) => false,
    }
}

#[cfg(unix)]
pub(crate) fn inode_of(meta: &Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
pub(crate) fn inode_of(_meta: &Metadata) -> u64 {
    0
}
