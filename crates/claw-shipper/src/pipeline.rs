//! Assembly of the full Discover → Watch → Tail → Aggregate pipeline.
//!
//! This module provides:
//! - [`PipelineConfig`], the settings of every stage plus queue sizes
//! - [`Pipeline`], which seeds the stages from a checkpoint, runs the
//!   periodic checkpoint timer and performs ordered shutdown
//!
//! Shutdown is upstream first: discovery and watching stop, the tailer
//! drains its queue, the aggregator drains and flushes, then the final
//! state is gathered and, unless a stage failed, checkpointed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::{Aggregator, AggregatorConfig, Seqs};
use crate::checkpoint::{assemble, CheckpointConfig, CheckpointStore, Seeds};
use crate::config::{Classifier, PathConfig, QueueCapacities};
use crate::discover::{Discover, DiscoverConfig};
use crate::error::{Result, ShipError};
use crate::queue::BoundedQueue;
use crate::tail::{Cursors, Tail, TailConfig};
use crate::tail_pool::TailPool;
use crate::types::{AggEvent, CheckpointState};
use crate::watch::{StatMap, Watch, WatchConfig};

/// Settings for every pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Input streams, in resolution order.
    pub inputs: Vec<PathConfig>,
    /// Discover stage.
    pub discover: DiscoverConfig,
    /// Watch stage.
    pub watch: WatchConfig,
    /// Tail stage.
    pub tail: TailConfig,
    /// Aggregator stage.
    pub aggregator: AggregatorConfig,
    /// Inter-stage queue sizes.
    pub queues: QueueCapacities,
    /// Checkpointing; disabled when `None`.
    pub checkpoint: Option<CheckpointConfig>,
    /// Number of tail workers.
    pub tail_pool_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            discover: DiscoverConfig::default(),
            watch: WatchConfig::default(),
            tail: TailConfig::default(),
            aggregator: AggregatorConfig::default(),
            queues: QueueCapacities::default(),
            checkpoint: None,
            tail_pool_size: 1,
        }
    }
}

impl PipelineConfig {
    /// Adds an input stream.
    #[must_use]
    pub fn with_input(mut self, input: PathConfig) -> Self {
        self.inputs.push(input);
        self
    }

    /// Sets the discover settings.
    #[must_use]
    pub fn with_discover(mut self, discover: DiscoverConfig) -> Self {
        self.discover = discover;
        self
    }

    /// Sets the watch settings.
    #[must_use]
    pub const fn with_watch(mut self, watch: WatchConfig) -> Self {
        self.watch = watch;
        self
    }

    /// Sets the tail settings.
    #[must_use]
    pub const fn with_tail(mut self, tail: TailConfig) -> Self {
        self.tail = tail;
        self
    }

    /// Sets the aggregator settings.
    #[must_use]
    pub fn with_aggregator(mut self, aggregator: AggregatorConfig) -> Self {
        self.aggregator = aggregator;
        self
    }

    /// Sets the queue sizes.
    #[must_use]
    pub const fn with_queues(mut self, queues: QueueCapacities) -> Self {
        self.queues = queues;
        self
    }

    /// Enables checkpointing.
    #[must_use]
    pub fn with_checkpoint(mut self, checkpoint: CheckpointConfig) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    /// Sets the number of tail workers (minimum 1).
    #[must_use]
    pub fn with_tail_pool_size(mut self, workers: usize) -> Self {
        self.tail_pool_size = workers.max(1);
        self
    }
}

#[derive(Debug)]
enum TailStage {
    Single(Tail),
    Pool(TailPool),
}

impl TailStage {
    fn cursor_handles(&self) -> Vec<Arc<Mutex<Cursors>>> {
        match self {
            Self::Single(tail) => vec![tail.cursors_handle()],
            Self::Pool(pool) => pool.cursors_handles(),
        }
    }

    async fn stop(self) -> Result<Cursors> {
        match self {
            Self::Single(tail) => tail.stop().await,
            Self::Pool(pool) => pool.stop().await,
        }
    }
}

/// Live views of every stage's state, used for periodic checkpoints.
#[derive(Debug)]
struct StateProbe {
    stats: Arc<Mutex<StatMap>>,
    cursors: Vec<Arc<Mutex<Cursors>>>,
    seqs: Arc<Mutex<Seqs>>,
}

impl StateProbe {
    fn stats(&self) -> StatMap {
        self.stats.lock().clone()
    }

    fn cursors(&self) -> Cursors {
        self.cursors
            .iter()
            .flat_map(|handle| handle.lock().clone())
            .collect()
    }

    fn seqs(&self) -> Seqs {
        self.seqs.lock().clone()
    }

    fn snapshot(&self) -> CheckpointState {
        assemble(&self.stats(), &self.cursors(), &self.seqs())
    }
}

/// A running pipeline.
#[derive(Debug)]
pub struct Pipeline {
    abort: CancellationToken,
    discover: Discover,
    watch: Watch,
    tail: TailStage,
    aggregator: Aggregator,
    probe: Arc<StateProbe>,
    store: Option<Arc<CheckpointStore>>,
    checkpointer: Option<(CancellationToken, JoinHandle<()>)>,
}

impl Pipeline {
    /// Starts every stage seeded from `state`. Events are pushed to `output`.
    ///
    /// When checkpointing is configured its directory is created and the
    /// periodic timer starts; `state` is used as given.
    ///
    /// # Errors
    ///
    /// Returns an error if the inputs fail to compile or the checkpoint
    /// directory cannot be created.
    pub fn start(
        config: PipelineConfig,
        output: Arc<BoundedQueue<AggEvent>>,
        state: CheckpointState,
    ) -> Result<Self> {
        let store = config
            .checkpoint
            .clone()
            .map(CheckpointStore::new)
            .transpose()?
            .map(Arc::new);
        Self::launch(config, output, &state, store)
    }

    /// Starts the pipeline from the newest checkpoint on disk, or cold when
    /// none exists or checkpointing is disabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the inputs fail to compile or the checkpoint
    /// directory cannot be created.
    pub fn resume(config: PipelineConfig, output: Arc<BoundedQueue<AggEvent>>) -> Result<Self> {
        let store = config
            .checkpoint
            .clone()
            .map(CheckpointStore::new)
            .transpose()?
            .map(Arc::new);
        let state = store
            .as_ref()
            .and_then(|store| store.load())
            .unwrap_or_default();
        Self::launch(config, output, &state, store)
    }

    fn launch(
        config: PipelineConfig,
        output: Arc<BoundedQueue<AggEvent>>,
        state: &CheckpointState,
        store: Option<Arc<CheckpointStore>>,
    ) -> Result<Self> {
        let classifier = Arc::new(Classifier::new(&config.inputs)?);
        let seeds = Seeds::from_state(state);
        let abort = CancellationToken::new();

        let discoveries = Arc::new(BoundedQueue::new(config.queues.discoveries));
        let deletions = Arc::new(BoundedQueue::new(config.queues.deletions));
        let watch_events = Arc::new(BoundedQueue::new(config.queues.watch_events));
        let tail_events = Arc::new(BoundedQueue::new(config.queues.tail_events));

        info!(
            inputs = config.inputs.len(),
            resumed_paths = state.len(),
            tail_workers = config.tail_pool_size.max(1),
            checkpoint = store.is_some(),
            "starting pipeline"
        );

        let discover = Discover::start(
            config.discover,
            Arc::clone(&classifier),
            Arc::clone(&discoveries),
            Arc::clone(&deletions),
            seeds.known,
            abort.child_token(),
        );
        let watch = Watch::start(
            config.watch,
            discoveries,
            deletions,
            Arc::clone(&watch_events),
            seeds.stats,
            abort.child_token(),
        );
        let tail = if config.tail_pool_size > 1 {
            TailStage::Pool(TailPool::start(
                config.tail_pool_size,
                &config.tail,
                watch_events,
                Arc::clone(&tail_events),
                seeds.cursors,
                abort.clone(),
            ))
        } else {
            TailStage::Single(Tail::start(
                config.tail,
                watch_events,
                Arc::clone(&tail_events),
                seeds.cursors,
                abort.clone(),
            ))
        };
        let aggregator = Aggregator::start(
            config.aggregator,
            classifier,
            tail_events,
            output,
            seeds.seqs,
            abort.clone(),
        );

        let probe = Arc::new(StateProbe {
            stats: watch.stats_handle(),
            cursors: tail.cursor_handles(),
            seqs: aggregator.seqs_handle(),
        });

        let checkpointer = store.as_ref().map(|store| {
            let stop = abort.child_token();
            let handle = tokio::spawn(run_checkpoints(
                Arc::clone(store),
                Arc::clone(&probe),
                stop.clone(),
            ));
            (stop, handle)
        });

        Ok(Self {
            abort,
            discover,
            watch,
            tail,
            aggregator,
            probe,
            store,
            checkpointer,
        })
    }

    /// Returns the current combined state of every stage.
    #[must_use]
    pub fn state(&self) -> CheckpointState {
        self.probe.snapshot()
    }

    /// Writes a checkpoint now. Returns `None` when checkpointing is disabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint cannot be written.
    pub async fn checkpoint(&self) -> Result<Option<PathBuf>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        save_blocking(Arc::clone(store), self.probe.snapshot())
            .await
            .map(Some)
    }

    /// Returns true once a stage has failed fatally.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Completes when a stage fails fatally.
    pub async fn failed(&self) {
        self.abort.cancelled().await;
    }

    /// Runs until a stage fails, then shuts down and reports the failure.
    ///
    /// # Errors
    ///
    /// Returns the fatal stage error.
    pub async fn wait(self) -> Result<CheckpointState> {
        self.failed().await;
        self.stop().await
    }

    /// Stops every stage in order, writes a final checkpoint and returns the
    /// final state.
    ///
    /// # Errors
    ///
    /// Returns the first stage failure. After a fatal failure no final
    /// checkpoint is written.
    pub async fn stop(self) -> Result<CheckpointState> {
        let mut first_error: Option<ShipError> = None;
        let mut record = |e: ShipError| {
            error!(error = %e, "stage failed during shutdown");
            first_error.get_or_insert(e);
        };

        if let Some((stop, handle)) = self.checkpointer {
            stop.cancel();
            if handle.await.is_err() {
                record(ShipError::StageAborted("checkpoint"));
            }
        }

        match self.discover.stop().await {
            Ok(known) => debug!(known = known.len(), "discover stopped"),
            Err(e) => record(e),
        }
        let stats = self.watch.stop().await.unwrap_or_else(|e| {
            record(e);
            self.probe.stats()
        });
        let cursors = self.tail.stop().await.unwrap_or_else(|e| {
            record(e);
            self.probe.cursors()
        });
        let seqs = self.aggregator.stop().await.unwrap_or_else(|e| {
            record(e);
            self.probe.seqs()
        });

        let state = assemble(&stats, &cursors, &seqs);
        match self.store {
            // Cursors may count lines that were dropped in flight; the last
            // periodic checkpoint stays authoritative.
            Some(_) if self.abort.is_cancelled() => {
                warn!(paths = state.len(), "pipeline aborted, final checkpoint skipped");
            }
            Some(store) => {
                if let Err(e) = save_blocking(store, state.clone()).await {
                    record(e);
                }
            }
            None => {}
        }

        info!(paths = state.len(), failed = first_error.is_some(), "pipeline stopped");
        first_error.map_or(Ok(state), Err)
    }
}

async fn save_blocking(store: Arc<CheckpointStore>, state: CheckpointState) -> Result<PathBuf> {
    tokio::task::spawn_blocking(move || store.save(&state))
        .await
        .map_err(|_| ShipError::StageAborted("checkpoint"))?
}

async fn run_checkpoints(
    store: Arc<CheckpointStore>,
    probe: Arc<StateProbe>,
    stop: CancellationToken,
) {
    let period = store.config().interval.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => break,
            _ = ticker.tick() => {
                match save_blocking(Arc::clone(&store), probe.snapshot()).await {
                    Ok(path) => debug!(path = %path.display(), "periodic checkpoint"),
                    Err(e) => warn!(error = %e, "periodic checkpoint failed"),
                }
            }
        }
    }
}
