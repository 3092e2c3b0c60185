//! Hash-partitioned set of [`Tail`] workers.
//!
//! A router task forwards each watch event to the worker owning its path,
//! so events for one path always reach the same worker in order.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{Result, ShipError};
use crate::queue::BoundedQueue;
use crate::tail::{Cursors, Tail, TailConfig};
use crate::types::{TailEvent, WatchEvent};

/// Returns the worker index owning `path` among `workers` workers.
#[must_use]
pub fn shard_for(path: &Path, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

/// Handle to a running pool of tail workers.
#[derive(Debug)]
pub struct TailPool {
    stop: CancellationToken,
    router: JoinHandle<()>,
    tails: Vec<Tail>,
}

impl TailPool {
    /// Starts `workers` tails (minimum 1) and the router feeding them.
    ///
    /// Seed cursors are split between workers the same way events are.
    pub fn start(
        workers: usize,
        config: &TailConfig,
        input: Arc<BoundedQueue<WatchEvent>>,
        output: Arc<BoundedQueue<TailEvent>>,
        cursors: Cursors,
        abort: CancellationToken,
    ) -> Self {
        let workers = workers.max(1);

        let mut seeds: Vec<Cursors> = (0..workers).map(|_| Cursors::new()).collect();
        for (path, cursor) in cursors {
            seeds[shard_for(&path, workers)].insert(path, cursor);
        }

        let queues: Vec<Arc<BoundedQueue<WatchEvent>>> = (0..workers)
            .map(|_| Arc::new(BoundedQueue::with_capacity(input.capacity())))
            .collect();

        let tails = queues
            .iter()
            .zip(seeds)
            .map(|(queue, seed)| {
                Tail::start(
                    config.clone(),
                    Arc::clone(queue),
                    Arc::clone(&output),
                    seed,
                    abort.clone(),
                )
            })
            .collect();

        let stop = abort.child_token();
        let router = {
            let stop = stop.clone();
            tokio::spawn(async move { route(input, queues, stop, abort).await })
        };

        info!(workers, "tail pool started");
        Self {
            stop,
            router,
            tails,
        }
    }

    /// Number of workers.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.tails.len()
    }

    /// Returns the merged committed cursors of every worker.
    #[must_use]
    pub fn cursors(&self) -> Cursors {
        self.tails.iter().flat_map(Tail::cursors).collect()
    }

    /// Returns shared handles to every worker's live cursor map.
    #[must_use]
    pub fn cursors_handles(&self) -> Vec<Arc<Mutex<Cursors>>> {
        self.tails.iter().map(Tail::cursors_handle).collect()
    }

    /// Stops the router, then every worker, and merges their cursors.
    ///
    /// # Errors
    ///
    /// Returns the first worker error, after all workers have stopped.
    pub async fn stop(self) -> Result<Cursors> {
        self.stop.cancel();
        self.router
            .await
            .map_err(|_| ShipError::StageAborted("tail router"))?;

        let results = join_all(self.tails.into_iter().map(Tail::stop)).await;
        let mut merged = Cursors::new();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(cursors) => merged.extend(cursors),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        info!(tracked = merged.len(), "tail pool stopped");
        first_error.map_or(Ok(merged), Err)
    }
}

async fn route(
    input: Arc<BoundedQueue<WatchEvent>>,
    queues: Vec<Arc<BoundedQueue<WatchEvent>>>,
    stop: CancellationToken,
    abort: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            event = input.pop() => event,
            () = stop.cancelled() => break,
        };
        if !forward(&queues, &abort, event).await {
            return;
        }
    }

    while let Some(event) = input.try_pop() {
        if !forward(&queues, &abort, event).await {
            return;
        }
    }
}

/// Pushes the event to its owning worker. Returns false if aborted.
async fn forward(
    queues: &[Arc<BoundedQueue<WatchEvent>>],
    abort: &CancellationToken,
    event: WatchEvent,
) -> bool {
    let queue = &queues[shard_for(event.path(), queues.len())];
    tokio::select! {
        biased;
        () = abort.cancelled() => false,
        () = queue.push(event) => true,
    }
}
