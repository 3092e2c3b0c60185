//! Periodic glob expansion feeding newly found files to the watcher.
//!
//! Discover owns the set of known paths. A path enters the set the first
//! time it matches an include glob and leaves it only when the watcher
//! reports it deleted, which makes it eligible to be discovered again.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Classifier;
use crate::error::{Result, ShipError};
use crate::queue::BoundedQueue;

/// Discover stage settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverConfig {
    /// Time between glob expansions.
    pub interval: Duration,
    /// Files last modified before this instant are never discovered.
    pub ignore_before: Option<DateTime<Utc>>,
}

impl Default for DiscoverConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            ignore_before: None,
        }
    }
}

impl DiscoverConfig {
    /// Sets the expansion interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the modification-time cutoff.
    #[must_use]
    pub const fn with_ignore_before(mut self, cutoff: Option<DateTime<Utc>>) -> Self {
        self.ignore_before = cutoff;
        self
    }
}

/// Handle to a running discover task.
#[derive(Debug)]
pub struct Discover {
    cancel: CancellationToken,
    handle: JoinHandle<HashSet<PathBuf>>,
}

impl Discover {
    /// Spawns the discover loop.
    ///
    /// Paths in `known` are never emitted until reported deleted. The loop
    /// exits when `cancel` (or its parent) is cancelled.
    pub fn start(
        config: DiscoverConfig,
        classifier: Arc<Classifier>,
        discoveries: Arc<BoundedQueue<PathBuf>>,
        deletions: Arc<BoundedQueue<PathBuf>>,
        known: HashSet<PathBuf>,
        cancel: CancellationToken,
    ) -> Self {
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            run(config, classifier, discoveries, deletions, known, task_cancel).await
        });
        Self { cancel, handle }
    }

    /// Stops the loop and returns the final known set.
    pub async fn stop(self) -> Result<HashSet<PathBuf>> {
        self.cancel.cancel();
        self.handle
            .await
            .map_err(|_| ShipError::StageAborted("discover"))
    }
}

async fn run(
    config: DiscoverConfig,
    classifier: Arc<Classifier>,
    discoveries: Arc<BoundedQueue<PathBuf>>,
    deletions: Arc<BoundedQueue<PathBuf>>,
    mut known: HashSet<PathBuf>,
    cancel: CancellationToken,
) -> HashSet<PathBuf> {
    info!(
        interval_ms = config.interval.as_millis() as u64,
        known = known.len(),
        "discover started"
    );

    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    'ticks: loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        for path in deletions.drain() {
            debug!(path = %path.display(), "forgetting deleted path");
            known.remove(&path);
        }

        let scan = {
            let classifier = Arc::clone(&classifier);
            let snapshot = known.clone();
            let cutoff = config.ignore_before;
            tokio::task::spawn_blocking(move || scan(&classifier, &snapshot, cutoff)).await
        };
        let found = match scan {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "discovery scan failed");
                continue;
            }
        };

        for path in found {
            debug!(path = %path.display(), "discovered");
            tokio::select! {
                biased;
                () = cancel.cancelled() => break 'ticks,
                () = discoveries.push(path.clone()) => {}
            }
            known.insert(path);
        }
    }

    info!(known = known.len(), "discover stopped");
    known
}

/// Expands every include glob and returns the new regular files, in config
/// and glob order, without duplicates.
#[must_use]
pub fn scan(
    classifier: &Classifier,
    known: &HashSet<PathBuf>,
    ignore_before: Option<DateTime<Utc>>,
) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();

    for rules in classifier.rules() {
        for include in &rules.includes {
            let entries = match glob::glob(include.as_str()) {
                Ok(entries) => entries,
                Err(e) => {
                    debug!(pattern = include.as_str(), error = %e, "glob expansion failed");
                    continue;
                }
            };

            for entry in entries {
                let path = match entry {
                    Ok(path) => path,
                    Err(e) => {
                        debug!(path = %e.path().display(), error = %e.error(), "glob entry unreadable");
                        continue;
                    }
                };

                if rules.is_excluded(&path) || known.contains(&path) || seen.contains(&path) {
                    continue;
                }
                if !is_candidate(&path, ignore_before) {
                    continue;
                }
                seen.insert(path.clone());
                found.push(path);
            }
        }
    }

    found
}

fn is_candidate(path: &Path, ignore_before: Option<DateTime<Utc>>) -> bool {
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "stat failed during discovery");
            return false;
        }
    };
    if !meta.is_file() {
        return false;
    }
    match (ignore_before, meta.modified()) {
        (Some(cutoff), Ok(modified)) => DateTime::<Utc>::from(modified) >= cutoff,
        _ => true,
    }
}
