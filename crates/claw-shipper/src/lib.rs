//! # claw-shipper
//!
//! Polling log-file shipper for Clawbernetes nodes.
//!
//! Files matching configured globs are discovered, stat-polled for changes,
//! read incrementally, assembled into (optionally multi-line) records and
//! handed to an output queue as structured [`AggEvent`]s. State is
//! checkpointed so a restart resumes where the previous run stopped.
//!
//! This crate provides:
//!
//! - [`BoundedQueue`]: capacity-limited async queue linking the stages
//! - [`Discover`]: glob expansion and the known-path set
//! - [`Watch`]: stat polling and change events
//! - [`Tail`] and [`TailPool`]: incremental, cursor-tracked reading
//! - [`Aggregator`]: multiline assembly, filtering and sequencing
//! - [`CheckpointStore`]: atomic, retained state snapshots
//! - [`Pipeline`]: the assembled stages with ordered shutdown
//! - [`AgentConfig`]: JSON configuration with validation
//!
//! ## Example
//!
//! ```rust
//! use claw_shipper::AgentConfig;
//!
//! let config = AgentConfig::from_json(
//!     r#"{"inputs": [{"type": "app", "includes": ["/var/log/app/*.log"]}], "host": "node-1"}"#,
//! )?;
//! let pipeline_config = config.pipeline_config()?;
//! assert_eq!(pipeline_config.inputs.len(), 1);
//! assert_eq!(pipeline_config.aggregator.host, "node-1");
//! # Ok::<(), claw_shipper::ConfigError>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregator;
pub mod checkpoint;
pub mod config;
pub mod discover;
pub mod error;
pub mod lines;
pub mod pipeline;
pub mod queue;
pub mod stat;
pub mod tail;
pub mod tail_pool;
pub mod types;
pub mod watch;

// Re-export main types
pub use aggregator::{Aggregator, AggregatorConfig, Seqs};
pub use checkpoint::{assemble, CheckpointConfig, CheckpointStore, Seeds};
pub use config::{AgentConfig, Classifier, PathConfig, PathRules, QueueCapacities};
pub use discover::{Discover, DiscoverConfig};
pub use error::{ConfigError, QueueError, Result, ShipError};
pub use lines::LineSplitter;
pub use pipeline::{Pipeline, PipelineConfig};
pub use queue::{BoundedQueue, Capacity};
pub use tail::{Cursors, Tail, TailConfig};
pub use tail_pool::TailPool;
pub use types::{
    AggEvent, CheckpointState, FileStat, Inode, PathState, TailEvent, WatchEvent, WatchEventKind,
};
pub use watch::{changes, StatMap, Watch, WatchConfig};
