//! Core data types flowing through the shipping pipeline.
//!
//! This module provides:
//! - [`FileStat`] and [`Inode`], the identity and size snapshot of a file
//! - [`WatchEvent`], the change events produced by the watcher
//! - [`TailEvent`], a single line read from a file
//! - [`AggEvent`], the structured event handed to the output sink
//! - [`PathState`] and [`CheckpointState`], the persisted per-path state

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys of [`AggEvent`] that a merged JSON body may never overwrite.
pub const RESERVED_KEYS: [&str; 6] = ["type", "host", "path", "message", "seq", JSON_ERROR_KEY];

/// Marker field attached when a JSON body could not be merged.
pub const JSON_ERROR_KEY: &str = "json_error";

/// Filesystem identity of a file: inode number plus device numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Inode {
    /// Inode number.
    pub number: u64,
    /// Device major number.
    pub major: u64,
    /// Device minor number.
    pub minor: u64,
}

/// Snapshot of a file's identity, size and modification time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    /// Identity of the file.
    pub inode: Inode,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time.
    pub mtime: DateTime<Utc>,
}

impl FileStat {
    /// Returns a copy with the size replaced.
    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }
}

/// Kind of a [`WatchEvent`], used in log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEventKind {
    /// File appeared.
    Created,
    /// File at the path was swapped for a different inode.
    Replaced,
    /// File shrank.
    Truncated,
    /// File grew.
    Appended,
    /// File disappeared.
    Deleted,
}

impl fmt::Display for WatchEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Replaced => "replaced",
            Self::Truncated => "truncated",
            Self::Appended => "appended",
            Self::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// A change observed on a tracked path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// The path started to exist.
    Created {
        /// Affected path.
        path: PathBuf,
    },
    /// The path now refers to a different file.
    Replaced {
        /// Affected path.
        path: PathBuf,
        /// Size of the new file.
        size: u64,
    },
    /// The file shrank.
    Truncated {
        /// Affected path.
        path: PathBuf,
        /// New size.
        size: u64,
    },
    /// The file grew.
    Appended {
        /// Affected path.
        path: PathBuf,
        /// New size.
        size: u64,
    },
    /// The path stopped existing.
    Deleted {
        /// Affected path.
        path: PathBuf,
    },
}

impl WatchEvent {
    /// Returns the path the event refers to.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Created { path }
            | Self::Replaced { path, .. }
            | Self::Truncated { path, .. }
            | Self::Appended { path, .. }
            | Self::Deleted { path } => path,
        }
    }

    /// Returns the file size carried by the event, if any.
    #[must_use]
    pub const fn size(&self) -> Option<u64> {
        match self {
            Self::Replaced { size, .. }
            | Self::Truncated { size, .. }
            | Self::Appended { size, .. } => Some(*size),
            Self::Created { .. } | Self::Deleted { .. } => None,
        }
    }

    /// Returns the event kind.
    #[must_use]
    pub const fn kind(&self) -> WatchEventKind {
        match self {
            Self::Created { .. } => WatchEventKind::Created,
            Self::Replaced { .. } => WatchEventKind::Replaced,
            Self::Truncated { .. } => WatchEventKind::Truncated,
            Self::Appended { .. } => WatchEventKind::Appended,
            Self::Deleted { .. } => WatchEventKind::Deleted,
        }
    }
}

/// One complete line read from a file, without its trailing newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailEvent {
    /// File the line came from.
    pub path: PathBuf,
    /// Line contents.
    pub line: String,
}

impl TailEvent {
    /// Creates a new tail event.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, line: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            line: line.into(),
        }
    }
}

/// A structured log event ready for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggEvent {
    /// Stream tag from the matching input configuration.
    #[serde(rename = "type")]
    pub kind: String,
    /// Host the agent runs on.
    pub host: String,
    /// Source file.
    pub path: PathBuf,
    /// The (possibly multi-line) message.
    pub message: String,
    /// Per-path sequence number, starting at 1.
    pub seq: u64,
    /// Extra fields merged from a JSON message body.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl AggEvent {
    /// Merges the top-level fields of a JSON object message into the event.
    ///
    /// Reserved keys are left untouched. A message that is not a JSON object
    /// is kept raw and a [`JSON_ERROR_KEY`] field describes the problem.
    pub fn merge_json_body(&mut self) {
        match serde_json::from_str::<Value>(&self.message) {
            Ok(Value::Object(body)) => {
                for (key, value) in body {
                    if !RESERVED_KEYS.contains(&key.as_str()) {
                        self.fields.insert(key, value);
                    }
                }
            }
            Ok(_) => {
                self.fields.insert(
                    JSON_ERROR_KEY.to_string(),
                    Value::String("message is not a JSON object".to_string()),
                );
            }
            Err(e) => {
                self.fields
                    .insert(JSON_ERROR_KEY.to_string(), Value::String(e.to_string()));
            }
        }
    }

    /// Returns true if a JSON merge was attempted and failed.
    #[must_use]
    pub fn has_json_error(&self) -> bool {
        self.fields.contains_key(JSON_ERROR_KEY)
    }
}

/// Persisted state of one path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathState {
    /// Last stat taken by the watcher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat: Option<FileStat>,
    /// Committed read offset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<u64>,
    /// Last emitted sequence number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

/// Full pipeline state keyed by path, as stored in a checkpoint.
pub type CheckpointState = BTreeMap<PathBuf, PathState>;
