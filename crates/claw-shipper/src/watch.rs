//! Stat polling and change detection.
//!
//! Watch keeps the last stat of every tracked path and, on each tick,
//! compares it with a fresh stat to produce [`WatchEvent`]s. Deleted paths
//! are dropped from the stat map and reported back to discovery.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, ShipError};
use crate::queue::BoundedQueue;
use crate::stat::{
    file_appended, file_created, file_deleted, file_replaced, file_truncated, stat_for,
};
use crate::types::{FileStat, WatchEvent};

/// Last observed stat per tracked path. `None` means tracked but not (yet)
/// present on disk.
pub type StatMap = HashMap<PathBuf, Option<FileStat>>;

/// Watch stage settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchConfig {
    /// Time between stat polls.
    pub interval: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
        }
    }
}

impl WatchConfig {
    /// Sets the poll interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Handle to a running watch task.
#[derive(Debug)]
pub struct Watch {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    stats: Arc<Mutex<StatMap>>,
}

impl Watch {
    /// Spawns the watch loop seeded with `stats`.
    pub fn start(
        config: WatchConfig,
        discoveries: Arc<BoundedQueue<PathBuf>>,
        deletions: Arc<BoundedQueue<PathBuf>>,
        events: Arc<BoundedQueue<WatchEvent>>,
        stats: StatMap,
        cancel: CancellationToken,
    ) -> Self {
        let stats = Arc::new(Mutex::new(stats));
        let task = Poller {
            discoveries,
            deletions,
            events,
            stats: Arc::clone(&stats),
        };
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move { task.run(config, task_cancel).await });
        Self {
            cancel,
            handle,
            stats,
        }
    }

    /// Returns a copy of the current stat map.
    #[must_use]
    pub fn stats(&self) -> StatMap {
        self.stats.lock().clone()
    }

    /// Returns a shared handle to the live stat map.
    #[must_use]
    pub fn stats_handle(&self) -> Arc<Mutex<StatMap>> {
        Arc::clone(&self.stats)
    }

    /// Stops the loop and returns the final stat map.
    pub async fn stop(self) -> Result<StatMap> {
        self.cancel.cancel();
        self.handle
            .await
            .map_err(|_| ShipError::StageAborted("watch"))?;
        Ok(self.stats.lock().clone())
    }
}

struct Poller {
    discoveries: Arc<BoundedQueue<PathBuf>>,
    deletions: Arc<BoundedQueue<PathBuf>>,
    events: Arc<BoundedQueue<WatchEvent>>,
    stats: Arc<Mutex<StatMap>>,
}

impl Poller {
    async fn run(self, config: WatchConfig, cancel: CancellationToken) {
        info!(
            interval_ms = config.interval.as_millis() as u64,
            tracked = self.stats.lock().len(),
            "watch started"
        );

        let mut ticker = interval(config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.tick(&cancel).await {
                break;
            }
        }

        info!(tracked = self.stats.lock().len(), "watch stopped");
    }

    /// Runs one poll. Returns false if cancelled part way through.
    async fn tick(&self, cancel: &CancellationToken) -> bool {
        {
            let mut stats = self.stats.lock();
            while let Some(path) = self.discoveries.try_pop() {
                stats.entry(path).or_insert(None);
            }
        }

        let tracked: Vec<(PathBuf, Option<FileStat>)> = self
            .stats
            .lock()
            .iter()
            .map(|(path, stat)| (path.clone(), stat.clone()))
            .collect();

        for (path, old) in tracked {
            let new = match stat_for(&path).await {
                Ok(stat) => stat,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "stat failed, keeping previous");
                    continue;
                }
            };

            let events = changes(&path, old.as_ref(), new.as_ref());
            let deleted = file_deleted(old.as_ref(), new.as_ref());

            for event in events {
                debug!(
                    path = %path.display(),
                    kind = %event.kind(),
                    size = event.size(),
                    "change detected"
                );
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return false,
                    () = self.events.push(event) => {}
                }
            }

            if deleted {
                self.stats.lock().remove(&path);
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return false,
                    () = self.deletions.push(path) => {}
                }
            } else {
                self.stats.lock().insert(path, new);
            }
        }
        true
    }
}

/// Computes the events describing the transition from `old` to `new`.
///
/// Creation and deletion are checked first. Independently of that, at most
/// one of replaced, appended or truncated is reported, in that order.
#[must_use]
pub fn changes(path: &Path, old: Option<&FileStat>, new: Option<&FileStat>) -> Vec<WatchEvent> {
    let mut events = Vec::new();
    let path_buf = || path.to_path_buf();

    if file_created(old, new) {
        events.push(WatchEvent::Created { path: path_buf() });
    } else if file_deleted(old, new) {
        events.push(WatchEvent::Deleted { path: path_buf() });
    }

    let Some(size) = new.map(|s| s.size) else {
        return events;
    };
    if file_replaced(old, new) {
        events.push(WatchEvent::Replaced {
            path: path_buf(),
            size,
        });
    } else if file_appended(old, new) {
        events.push(WatchEvent::Appended {
            path: path_buf(),
            size,
        });
    } else if file_truncated(old, new) {
        events.push(WatchEvent::Truncated {
            path: path_buf(),
            size,
        });
    }
    events
}
