//! Durable snapshots of per-path pipeline state.
//!
//! A checkpoint records, for every watched path, the last stat, the
//! committed read cursor and the last sequence number. Files are written
//! atomically (temp file, fsync, rename) with timestamped names, and only
//! the newest few are retained.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::aggregator::Seqs;
use crate::error::{Result, ShipError};
use crate::tail::Cursors;
use crate::types::{CheckpointState, PathState};
use crate::watch::StatMap;

/// Checkpoint settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointConfig {
    /// Directory holding checkpoint files.
    pub dir: PathBuf,
    /// Time between periodic checkpoints.
    pub interval: Duration,
    /// Number of checkpoint files kept.
    pub retain: usize,
    /// File name prefix.
    pub prefix: String,
}

impl CheckpointConfig {
    /// Creates a config for the given directory with default settings.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            interval: Duration::from_secs(30),
            retain: 2,
            prefix: "checkpoint".to_string(),
        }
    }

    /// Sets the checkpoint interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets how many files are kept (minimum 1).
    #[must_use]
    pub fn with_retain(mut self, retain: usize) -> Self {
        self.retain = retain.max(1);
        self
    }

    /// Sets the file name prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

/// Reads and writes checkpoint files in one directory.
#[derive(Debug)]
pub struct CheckpointStore {
    config: CheckpointConfig,
    file_seq: AtomicU64,
}

impl CheckpointStore {
    /// Opens the store, creating its directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(config: CheckpointConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        Ok(Self {
            config,
            file_seq: AtomicU64::new(0),
        })
    }

    /// Returns the store configuration.
    #[must_use]
    pub const fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    /// Writes a new checkpoint and prunes old ones. Returns the new file.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be serialized or written.
    pub fn save(&self, state: &CheckpointState) -> Result<PathBuf> {
        let body = serde_json::to_vec(state)?;
        let name = self.generate_filename();
        let path = self.config.dir.join(&name);
        let tmp = self.config.dir.join(format!(".{name}.tmp"));

        write_synced(&tmp, &body)
            .and_then(|()| fs::rename(&tmp, &path))
            .map_err(|e| {
                let _ = fs::remove_file(&tmp);
                ShipError::Checkpoint(format!("failed to write {}: {e}", path.display()))
            })?;

        debug!(path = %path.display(), paths = state.len(), bytes = body.len(), "checkpoint written");
        self.enforce_retention();
        Ok(path)
    }

    /// Loads the newest readable checkpoint, falling back to older ones.
    ///
    /// Returns `None` when no usable checkpoint exists.
    pub fn load(&self) -> Option<CheckpointState> {
        for path in self.files().into_iter().rev() {
            match read_state(&path) {
                Ok(Some(state)) => {
                    info!(path = %path.display(), paths = state.len(), "checkpoint loaded");
                    return Some(state);
                }
                Ok(None) => {
                    warn!(path = %path.display(), "checkpoint is empty, trying older");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "checkpoint unreadable, trying older");
                }
            }
        }
        info!(dir = %self.config.dir.display(), "no checkpoint found, starting cold");
        None
    }

    /// Lists checkpoint files, oldest first.
    #[must_use]
    pub fn files(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.config.dir) else {
            return Vec::new();
        };
        let prefix = format!("{}.", self.config.prefix);
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension().is_some_and(|ext| ext == "json")
                    && p.file_name()
                        .is_some_and(|n| n.to_string_lossy().starts_with(&prefix))
            })
            .collect();
        files.sort();
        files
    }

    fn enforce_retention(&self) {
        let files = self.files();
        let excess = files.len().saturating_sub(self.config.retain);
        for old in &files[..excess] {
            match fs::remove_file(old) {
                Ok(()) => debug!(path = %old.display(), "old checkpoint removed"),
                Err(e) => warn!(path = %old.display(), error = %e, "failed to remove old checkpoint"),
            }
        }
    }

    fn generate_filename(&self) -> String {
        let timestamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let seq = self.file_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}.{timestamp}.{seq:04}.json", self.config.prefix)
    }
}

fn write_synced(path: &Path, body: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(body)?;
    file.sync_all()
}

fn read_state(path: &Path) -> Result<Option<CheckpointState>> {
    let body = fs::read(path)?;
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&body)?))
}

/// Combines the stage snapshots into one state, keyed by the watched paths.
#[must_use]
pub fn assemble(stats: &StatMap, cursors: &Cursors, seqs: &Seqs) -> CheckpointState {
    stats
        .iter()
        .map(|(path, stat)| {
            (
                path.clone(),
                PathState {
                    stat: stat.clone(),
                    cursor: cursors.get(path).copied(),
                    seq: seqs.get(path).copied(),
                },
            )
        })
        .collect()
}

/// Stage seeds recovered from a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Seeds {
    /// Paths discovery should treat as already known.
    pub known: HashSet<PathBuf>,
    /// Initial watcher stats, with sizes rewound to the committed cursor.
    pub stats: StatMap,
    /// Initial tail cursors.
    pub cursors: Cursors,
    /// Initial sequence counters.
    pub seqs: Seqs,
}

impl Seeds {
    /// Splits a checkpoint into per-stage seeds.
    ///
    /// Each stat's size is rewound to the path's cursor (zero when absent)
    /// so the watcher asks the tailer only for bytes not yet consumed.
    #[must_use]
    pub fn from_state(state: &CheckpointState) -> Self {
        let mut seeds = Self::default();
        for (path, entry) in state {
            seeds.known.insert(path.clone());
            let rewound = entry
                .stat
                .clone()
                .map(|stat| stat.with_size(entry.cursor.unwrap_or(0)));
            seeds.stats.insert(path.clone(), rewound);
            if let Some(cursor) = entry.cursor {
                seeds.cursors.insert(path.clone(), cursor);
            }
            if let Some(seq) = entry.seq {
                seeds.seqs.insert(path.clone(), seq);
            }
        }
        seeds
    }
}
