//! Round and sharelog file discovery
//!
//! Nothing is cached here: every call lists the filesystem again, and any
//! unreadable directory reads as empty. [`RoundDiscovery::read_rounds`] is
//! the one exception and reports why the root could not be listed.

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Width of a round directory name
pub const ROUND_NAME_LEN: usize = 8;

/// Round directories are fixed-width hexadecimal, so name order is round order
pub fn is_round_name(name: &str) -> bool {
    name.len() == ROUND_NAME_LEN && name.chars().all(|c| c.is_ascii_hexdigit())
}

/// Lists rounds and their sharelog files under a root directory
#[derive(Debug, Clone)]
pub struct RoundDiscovery {
    root: PathBuf,
    suffix: String,
}

impl RoundDiscovery {
    /// Create a discovery over `root`, recognising files ending in `suffix`
    pub fn new(root: impl Into<PathBuf>, suffix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            suffix: suffix.into(),
        }
    }

    /// All round directory names, ascending; an unreadable root has none
    pub async fn list_rounds(&self) -> Vec<String> {
        match self.read_rounds().await {
            Ok(rounds) => rounds,
            Err(e) => {
                debug!(root = %self.root.display(), error = %e, "Logs root unreadable");
                Vec::new()
            }
        }
    }

    /// All round directory names, ascending
    ///
    /// A missing root has no rounds; any other failure to list it is an error.
    pub async fn read_rounds(&self) -> io::Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut rounds = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if is_round_name(name) {
                    rounds.push(name.to_string());
                }
            }
        }

        rounds.sort();
        Ok(rounds)
    }

    /// The last `depth` rounds, ascending
    pub async fn recent_rounds(&self, depth: usize) -> Vec<String> {
        last_rounds(self.list_rounds().await, depth)
    }

    /// The last `depth` rounds, failing like [`RoundDiscovery::read_rounds`]
    pub async fn read_recent_rounds(&self, depth: usize) -> io::Result<Vec<String>> {
        Ok(last_rounds(self.read_rounds().await?, depth))
    }

    /// Sharelog files of one round, sorted by name
    pub async fn list_files(&self, round: &str) -> Vec<PathBuf> {
        let dir = self.root.join(round);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "Round directory unreadable");
                return Vec::new();
            }
        };

        let mut files = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            let matches_suffix = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.ends_with(&self.suffix));
            if matches_suffix {
                files.push(entry.path());
            }
        }

        files.sort();
        files
    }
}

fn last_rounds(mut rounds: Vec<String>, depth: usize) -> Vec<String> {
    let start = rounds.len().saturating_sub(depth);
    rounds.drain(..start);
    rounds
}

/// Round name of a sharelog path (its parent directory name)
pub fn round_of(path: &Path) -> Option<String> {
    path.parent()?
        .file_name()?
        .to_str()
        .map(str::to_string)
}
