//! Work-stream log tailer: truncation-safe, newline-aware byte-offset
//! tracking over a single append-only JSON-lines file. Generalizes the
//! donor's directory-watching `FileWatcher` to single-file tailing — `notify`
//! is used only to wake the poll loop, never to interpret what changed.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};

#[derive(Debug, thiserror::Error)]
pub enum TailerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),
}

pub type Result<T> = std::result::Result<T, TailerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// Seek to EOF — default. Avoids re-emitting historical alerts.
    Eof,
    /// Replay from offset 0.
    Start,
}

/// Tails a single append-only file, handing back complete lines only.
pub struct LogTailer {
    path: PathBuf,
    offset: u64,
}

impl LogTailer {
    pub fn open(path: impl Into<PathBuf>, start: StartPosition) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            File::create(&path)?;
        }
        let offset = match start {
            StartPosition::Eof => std::fs::metadata(&path)?.len(),
            StartPosition::Start => 0,
        };
        Ok(Self { path, offset })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read any new complete lines since the last call. Handles truncation
    /// (resets to 0) and trailing partial lines (not consumed — picked up
    /// whole on the next call).
    pub fn read_new_lines(&mut self) -> Result<Vec<String>> {
        let metadata = match std::fs::metadata(&self.path) {
            Ok(m) => m,
            Err(_) => return Ok(Vec::new()), // deleted; caller retries later
        };
        let len = metadata.len();

        if len < self.offset {
            self.offset = 0;
        }

        if len == self.offset {
            return Ok(Vec::new());
        }

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;

        let mut lines = Vec::new();
        let mut consumed: u64 = 0;
        for segment in buf.split_inclusive('\n') {
            if let Some(line) = segment.strip_suffix('\n') {
                if !line.is_empty() {
                    lines.push(line.to_string());
                }
                consumed += segment.len() as u64;
            }
            // trailing partial line (no '\n'): not consumed, picked up next time
        }

        self.offset += consumed;
        Ok(lines)
    }
}

/// Wakes on any modification/creation of `path`'s parent directory so the
/// tailer can be re-polled without busy-waiting. Mirrors the donor's
/// `notify::recommended_watcher` callback pattern.
pub struct ChangeWaiter {
    _watcher: RecommendedWatcher,
    rx: crossbeam_channel::Receiver<()>,
}

impl ChangeWaiter {
    pub fn new(path: &Path) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                let _ = tx.send(());
            }
        })?;
        let watch_dir = path.parent().unwrap_or_else(|| Path::new("."));
        watcher.watch(watch_dir, RecursiveMode::NonRecursive)?;
        Ok(Self { _watcher: watcher, rx })
    }

    /// Blocks until a change is observed or `timeout` elapses.
    pub fn wait(&self, timeout: std::time::Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }
}
