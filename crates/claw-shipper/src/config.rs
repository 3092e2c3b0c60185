//! Agent configuration.
//!
//! This module provides:
//! - [`PathConfig`], one input stream: globs, multiline pattern, filters
//! - [`PathRules`] and [`Classifier`], the compiled form used at runtime
//! - [`QueueCapacities`], the sizes of the inter-stage queues
//! - [`AgentConfig`], the JSON document the agent is started from

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use glob::Pattern;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::aggregator::AggregatorConfig;
use crate::checkpoint::CheckpointConfig;
use crate::discover::DiscoverConfig;
use crate::error::ConfigError;
use crate::pipeline::PipelineConfig;
use crate::tail::TailConfig;
use crate::watch::WatchConfig;

/// Configuration of one input stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Stream tag attached to every event from matching files.
    #[serde(rename = "type")]
    pub kind: String,
    /// Glob patterns selecting files, tried in order.
    pub includes: Vec<String>,
    /// Glob patterns matched against the basename; a match excludes the file.
    pub excludes: Vec<String>,
    /// Regex marking the first line of a record. Enables multiline buffering.
    pub multiline: Option<String>,
    /// If non-empty, only messages matching one of these are emitted.
    pub keep: Vec<String>,
    /// Messages matching any of these are discarded.
    pub drop: Vec<String>,
    /// Parse messages as JSON objects and merge their fields.
    pub json: bool,
}

impl PathConfig {
    /// Creates a config for the given stream tag.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }

    /// Adds an include glob.
    #[must_use]
    pub fn with_include(mut self, pattern: impl Into<String>) -> Self {
        self.includes.push(pattern.into());
        self
    }

    /// Adds an exclude glob.
    #[must_use]
    pub fn with_exclude(mut self, pattern: impl Into<String>) -> Self {
        self.excludes.push(pattern.into());
        self
    }

    /// Sets the multiline boundary pattern.
    #[must_use]
    pub fn with_multiline(mut self, pattern: impl Into<String>) -> Self {
        self.multiline = Some(pattern.into());
        self
    }

    /// Adds a keep pattern.
    #[must_use]
    pub fn with_keep(mut self, pattern: impl Into<String>) -> Self {
        self.keep.push(pattern.into());
        self
    }

    /// Adds a drop pattern.
    #[must_use]
    pub fn with_drop(mut self, pattern: impl Into<String>) -> Self {
        self.drop.push(pattern.into());
        self
    }

    /// Enables or disables JSON body merging.
    #[must_use]
    pub const fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Compiles the patterns of this config.
    ///
    /// # Errors
    ///
    /// Returns an error if the tag is empty or any pattern fails to compile.
    pub fn compile(&self) -> Result<PathRules, ConfigError> {
        if self.kind.is_empty() {
            return Err(ConfigError::Invalid {
                field: "type",
                reason: "input type cannot be empty".to_string(),
            });
        }

        Ok(PathRules {
            kind: self.kind.clone(),
            includes: compile_globs(&self.includes)?,
            excludes: compile_globs(&self.excludes)?,
            multiline: self.multiline.as_deref().map(compile_regex).transpose()?,
            keep: compile_regexes(&self.keep)?,
            drop: compile_regexes(&self.drop)?,
            json: self.json,
        })
    }
}

fn compile_globs(patterns: &[String]) -> Result<Vec<Pattern>, ConfigError> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p).map_err(|source| ConfigError::Glob {
                pattern: p.clone(),
                source,
            })
        })
        .collect()
}

fn compile_regex(pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|source| ConfigError::Regex {
        pattern: pattern.to_string(),
        source,
    })
}

fn compile_regexes(patterns: &[String]) -> Result<Vec<Regex>, ConfigError> {
    patterns.iter().map(|p| compile_regex(p)).collect()
}

/// A compiled [`PathConfig`].
#[derive(Debug, Clone)]
pub struct PathRules {
    /// Stream tag.
    pub kind: String,
    /// Include globs.
    pub includes: Vec<Pattern>,
    /// Exclude globs, matched against basenames.
    pub excludes: Vec<Pattern>,
    /// Multiline boundary.
    pub multiline: Option<Regex>,
    /// Keep filters.
    pub keep: Vec<Regex>,
    /// Drop filters.
    pub drop: Vec<Regex>,
    /// JSON body merging.
    pub json: bool,
}

impl PathRules {
    /// Returns true if any include glob matches the full path.
    #[must_use]
    pub fn matches(&self, path: &Path) -> bool {
        self.includes.iter().any(|p| p.matches_path(path))
    }

    /// Returns true if any exclude glob matches the path's basename.
    #[must_use]
    pub fn is_excluded(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        self.excludes.iter().any(|p| p.matches(name))
    }

    /// Applies the drop and keep filters to a message.
    #[must_use]
    pub fn accepts(&self, message: &str) -> bool {
        if self.drop.iter().any(|re| re.is_match(message)) {
            return false;
        }
        self.keep.is_empty() || self.keep.iter().any(|re| re.is_match(message))
    }
}

/// Resolves a path to the first input config that claims it.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    rules: Vec<PathRules>,
}

impl Classifier {
    /// Compiles every config, preserving order.
    ///
    /// # Errors
    ///
    /// Returns the first compile error.
    pub fn new(configs: &[PathConfig]) -> Result<Self, ConfigError> {
        let rules = configs
            .iter()
            .map(PathConfig::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// All compiled rules, in config order.
    #[must_use]
    pub fn rules(&self) -> &[PathRules] {
        &self.rules
    }

    /// Index of the first config whose includes match the path and whose
    /// excludes do not match its basename.
    #[must_use]
    pub fn resolve_index(&self, path: &Path) -> Option<usize> {
        self.rules
            .iter()
            .position(|rules| rules.matches(path) && !rules.is_excluded(path))
    }

    /// The first config claiming the path.
    #[must_use]
    pub fn resolve(&self, path: &Path) -> Option<&PathRules> {
        self.resolve_index(path).map(|i| &self.rules[i])
    }

    /// Rules at a previously resolved index.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&PathRules> {
        self.rules.get(index)
    }
}

/// Capacities of the inter-stage queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueCapacities {
    /// Discover to Watch.
    pub discoveries: usize,
    /// Watch back to Discover.
    pub deletions: usize,
    /// Watch to Tail.
    pub watch_events: usize,
    /// Tail to Aggregator.
    pub tail_events: usize,
}

impl Default for QueueCapacities {
    fn default() -> Self {
        Self {
            discoveries: 4096,
            deletions: 4096,
            watch_events: 4096,
            tail_events: 4096,
        }
    }
}

/// Top-level agent configuration, loaded from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Input streams, in resolution order.
    pub inputs: Vec<PathConfig>,
    /// Seconds between glob expansions.
    pub discover_interval_secs: u64,
    /// Seconds between stat polls.
    pub watch_interval_secs: u64,
    /// Seconds a file handle may stay idle before it is closed.
    pub eviction_interval_secs: u64,
    /// Seconds before a buffered multiline record is flushed.
    pub flush_interval_secs: u64,
    /// Maximum bytes read per chunk.
    pub block_size: usize,
    /// Reads larger than this many bytes log a warning.
    pub large_read_warn: u64,
    /// Longest unterminated line tolerated before the pipeline fails.
    pub max_line_length: usize,
    /// Queue sizes.
    pub queues: QueueCapacities,
    /// Directory for checkpoint files. No checkpoints when unset.
    pub checkpoint_dir: Option<PathBuf>,
    /// Seconds between checkpoints.
    pub checkpoint_interval_secs: u64,
    /// Number of checkpoint files kept.
    pub checkpoint_retain: usize,
    /// Skip files last modified before this instant.
    pub ignore_before: Option<DateTime<Utc>>,
    /// Number of tail workers. One when unset.
    pub tail_pool_size: Option<usize>,
    /// Emit the partial trailing line when a file is truncated or replaced.
    pub flush_partial_on_reset: bool,
    /// Host name override. Resolved from the OS when unset.
    pub host: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let tail = TailConfig::default();
        Self {
            inputs: Vec::new(),
            discover_interval_secs: 5,
            watch_interval_secs: 1,
            eviction_interval_secs: 5,
            flush_interval_secs: 5,
            block_size: tail.block_size,
            large_read_warn: tail.large_read_warn,
            max_line_length: tail.max_line_length,
            queues: QueueCapacities::default(),
            checkpoint_dir: None,
            checkpoint_interval_secs: 30,
            checkpoint_retain: 2,
            ignore_before: None,
            tail_pool_size: None,
            flush_partial_on_reset: false,
            host: None,
        }
    }
}

impl AgentConfig {
    /// Loads and validates configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// Parses and validates configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or fails validation.
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("discover_interval_secs", self.discover_interval_secs),
            ("watch_interval_secs", self.watch_interval_secs),
            ("eviction_interval_secs", self.eviction_interval_secs),
            ("flush_interval_secs", self.flush_interval_secs),
            ("checkpoint_interval_secs", self.checkpoint_interval_secs),
            ("block_size", self.block_size as u64),
            ("max_line_length", self.max_line_length as u64),
            ("checkpoint_retain", self.checkpoint_retain as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if self.tail_pool_size == Some(0) {
            return Err(ConfigError::Invalid {
                field: "tail_pool_size",
                reason: "must be greater than zero".to_string(),
            });
        }

        if self.host.as_deref() == Some("") {
            return Err(ConfigError::Invalid {
                field: "host",
                reason: "cannot be empty".to_string(),
            });
        }

        Classifier::new(&self.inputs)?;
        Ok(())
    }

    /// Builds the runtime pipeline configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn pipeline_config(&self) -> Result<PipelineConfig, ConfigError> {
        self.validate()?;

        let host = self
            .host
            .clone()
            .unwrap_or_else(AggregatorConfig::resolve_hostname);

        Ok(PipelineConfig {
            inputs: self.inputs.clone(),
            discover: DiscoverConfig::default()
                .with_interval(Duration::from_secs(self.discover_interval_secs))
                .with_ignore_before(self.ignore_before),
            watch: WatchConfig::default()
                .with_interval(Duration::from_secs(self.watch_interval_secs)),
            tail: TailConfig::default()
                .with_eviction_interval(Duration::from_secs(self.eviction_interval_secs))
                .with_block_size(self.block_size)
                .with_large_read_warn(self.large_read_warn)
                .with_max_line_length(self.max_line_length)
                .with_flush_partial_on_reset(self.flush_partial_on_reset),
            aggregator: AggregatorConfig::new(host)
                .with_flush_interval(Duration::from_secs(self.flush_interval_secs)),
            queues: self.queues,
            checkpoint: self.checkpoint_dir.as_ref().map(|dir| {
                CheckpointConfig::new(dir)
                    .with_interval(Duration::from_secs(self.checkpoint_interval_secs))
                    .with_retain(self.checkpoint_retain)
            }),
            tail_pool_size: self.tail_pool_size.unwrap_or(1),
        })
    }
}
