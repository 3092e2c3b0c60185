//! Error types for the shipping pipeline.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while running the pipeline.
#[derive(Debug, Error)]
pub enum ShipError {
    /// The configuration could not be loaded or compiled.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A file produced an unterminated line longer than the configured limit.
    #[error("unterminated line in {path} exceeds {limit} bytes")]
    LineTooLong {
        /// File being read.
        path: PathBuf,
        /// Configured maximum line length.
        limit: usize,
    },

    /// A read hit end of file before the size reported by the watcher,
    /// although the file on disk still claims to be at least that large.
    #[error("short read on {path}: expected {expected} bytes, stopped at {actual}")]
    ShortRead {
        /// File being read.
        path: PathBuf,
        /// Size reported by the change event.
        expected: u64,
        /// Offset at which the read stopped.
        actual: u64,
    },

    /// A checkpoint file could not be written or read.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A background stage panicked or was aborted.
    #[error("{0} stage terminated abnormally")]
    StageAborted(&'static str),
}

impl ShipError {
    /// Returns true for the resource-exhaustion conditions that stop the
    /// whole pipeline.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::LineTooLong { .. } | Self::ShortRead { .. } | Self::StageAborted(_)
        )
    }
}

/// Errors raised while loading or compiling configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A glob pattern failed to parse.
    #[error("invalid glob pattern {pattern:?}: {source}")]
    Glob {
        /// The offending pattern.
        pattern: String,
        /// Underlying parse error.
        #[source]
        source: glob::PatternError,
    },

    /// A regular expression failed to compile.
    #[error("invalid regex {pattern:?}: {source}")]
    Regex {
        /// The offending pattern.
        pattern: String,
        /// Underlying compile error.
        #[source]
        source: regex::Error,
    },

    /// A field holds a value outside its accepted range.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Name of the field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// The configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path of the file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration document is not valid JSON for the schema.
    #[error("invalid config document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors returned by non-waiting or deadline-bound queue operations.
///
/// The rejected item is handed back so the caller decides what to do with it.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError<T> {
    /// The queue was at capacity.
    #[error("queue is full")]
    Full(T),

    /// The queue stayed at capacity until the deadline passed.
    #[error("push timed out after {timeout:?}")]
    Timeout {
        /// The item that could not be enqueued.
        item: T,
        /// How long the push waited.
        timeout: Duration,
    },
}

impl<T> QueueError<T> {
    /// Recovers the rejected item.
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(item) | Self::Timeout { item, .. } => item,
        }
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, ShipError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = ShipError::LineTooLong {
            path: PathBuf::from("/var/log/app.log"),
            limit: 1024,
        };
        assert_eq!(
            err.to_string(),
            "unterminated line in /var/log/app.log exceeds 1024 bytes"
        );

        let err = ShipError::ShortRead {
            path: PathBuf::from("/var/log/app.log"),
            expected: 100,
            actual: 40,
        };
        assert_eq!(
            err.to_string(),
            "short read on /var/log/app.log: expected 100 bytes, stopped at 40"
        );

        let err = ShipError::StageAborted("tail");
        assert_eq!(err.to_string(), "tail stage terminated abnormally");
    }

    #[test]
    fn fatal_classification() {
        assert!(
            ShipError::LineTooLong {
                path: PathBuf::new(),
                limit: 1
            }
            .is_fatal()
        );
        assert!(!ShipError::Checkpoint("disk full".to_string()).is_fatal());

        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(!ShipError::from(io_err).is_fatal());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ShipError>();
        assert_send_sync::<ConfigError>();
        assert_send_sync::<QueueError<String>>();
    }

    #[test]
    fn config_error_wraps_into_ship_error() {
        let err: ShipError = ConfigError::Invalid {
            field: "block_size",
            reason: "must be greater than zero".to_string(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "configuration error: invalid value for block_size: must be greater than zero"
        );
    }

    #[test]
    fn queue_error_returns_item() {
        let err = QueueError::Full("line".to_string());
        assert_eq!(err.to_string(), "queue is full");
        assert_eq!(err.into_inner(), "line");

        let err = QueueError::Timeout {
            item: 7,
            timeout: Duration::from_millis(5),
        };
        assert_eq!(err.to_string(), "push timed out after 5ms");
        assert_eq!(err.into_inner(), 7);
    }
}
