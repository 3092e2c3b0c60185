//! Multiline assembly, classification and event construction.
//!
//! This module provides:
//! - Per-path multiline buffering keyed on a boundary regex
//! - Timed flushing of buffers that stopped receiving lines
//! - Keep/drop filtering and optional JSON body merging
//! - Per-path sequence numbers starting at 1
//!
//! Capture and flush run as separate tasks. They share each path's buffer
//! through an async mutex so a record is never split between them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Map;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Classifier;
use crate::error::{Result, ShipError};
use crate::queue::BoundedQueue;
use crate::types::{AggEvent, TailEvent};

/// Last emitted sequence number per path.
pub type Seqs = HashMap<PathBuf, u64>;

/// Aggregator stage settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatorConfig {
    /// Age after which a buffered multiline record is flushed.
    pub flush_interval: Duration,
    /// Host name attached to every event.
    pub host: String,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self::new(Self::resolve_hostname())
    }
}

impl AggregatorConfig {
    /// Creates a config with the given host name and default flush interval.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            flush_interval: Duration::from_secs(5),
            host: host.into(),
        }
    }

    /// Sets the flush interval.
    #[must_use]
    pub const fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Reads the OS host name, falling back to `localhost`.
    #[must_use]
    pub fn resolve_hostname() -> String {
        hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "localhost".to_string())
    }
}

#[derive(Debug)]
struct LineBuffer {
    lines: Vec<String>,
    modified: Instant,
}

impl LineBuffer {
    fn take_message(&mut self) -> Option<String> {
        if self.lines.is_empty() {
            return None;
        }
        let message = self.lines.join("\n");
        self.lines.clear();
        Some(message)
    }
}

struct Assembler {
    classifier: Arc<Classifier>,
    host: String,
    flush_interval: Duration,
    types: Mutex<HashMap<PathBuf, Option<usize>>>,
    buffers: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<LineBuffer>>>>,
    seqs: Arc<Mutex<Seqs>>,
    output: Arc<BoundedQueue<AggEvent>>,
    abort: CancellationToken,
}

impl Assembler {
    /// Resolves and caches the config index for a path. Unclaimed paths are
    /// reported once.
    fn resolve(&self, path: &Path) -> Option<usize> {
        let mut types = self.types.lock();
        if let Some(cached) = types.get(path) {
            return *cached;
        }
        let index = self.classifier.resolve_index(path);
        if index.is_none() {
            warn!(path = %path.display(), "no input type matches path, dropping its lines");
        }
        types.insert(path.to_path_buf(), index);
        index
    }

    fn buffer_for(&self, path: &Path) -> Arc<tokio::sync::Mutex<LineBuffer>> {
        let mut buffers = self.buffers.lock();
        let buffer = buffers.entry(path.to_path_buf()).or_insert_with(|| {
            Arc::new(tokio::sync::Mutex::new(LineBuffer {
                lines: Vec::new(),
                modified: Instant::now(),
            }))
        });
        Arc::clone(buffer)
    }

    /// Locks the path's buffer. Retries if a flush retired the buffer while
    /// this call was waiting for it.
    async fn lock_buffer(&self, path: &Path) -> OwnedMutexGuard<LineBuffer> {
        loop {
            let buffer = self.buffer_for(path);
            let guard = Arc::clone(&buffer).lock_owned().await;
            let current = self
                .buffers
                .lock()
                .get(path)
                .is_some_and(|mapped| Arc::ptr_eq(mapped, &buffer));
            if current {
                return guard;
            }
        }
    }

    /// Drops the map entry for an emptied buffer. The caller holds the
    /// buffer's lock.
    fn retire(&self, path: &Path, buffer: &Arc<tokio::sync::Mutex<LineBuffer>>) {
        let mut buffers = self.buffers.lock();
        if buffers
            .get(path)
            .is_some_and(|mapped| Arc::ptr_eq(mapped, buffer))
        {
            buffers.remove(path);
        }
    }

    async fn capture(&self, event: TailEvent) {
        let Some(index) = self.resolve(&event.path) else {
            return;
        };
        let Some(boundary) = self
            .classifier
            .get(index)
            .and_then(|rules| rules.multiline.as_ref())
        else {
            self.emit(index, &event.path, event.line).await;
            return;
        };

        let mut guard = self.lock_buffer(&event.path).await;
        if boundary.is_match(&event.line) {
            if let Some(message) = guard.take_message() {
                self.emit(index, &event.path, message).await;
            }
        }
        guard.lines.push(event.line);
        guard.modified = Instant::now();
    }

    /// Emits every buffered record older than the flush interval, or every
    /// buffered record when `force` is set. Flushed buffers leave the map.
    async fn flush(&self, force: bool) -> usize {
        let started = Instant::now();
        let buffers: Vec<(PathBuf, Arc<tokio::sync::Mutex<LineBuffer>>)> = self
            .buffers
            .lock()
            .iter()
            .map(|(path, buffer)| (path.clone(), Arc::clone(buffer)))
            .collect();

        let mut flushed = 0;
        for (path, buffer) in buffers {
            let mut guard = buffer.lock().await;
            let stale = started.saturating_duration_since(guard.modified) >= self.flush_interval;
            if !force && !stale {
                continue;
            }
            if let Some(message) = guard.take_message() {
                if let Some(index) = self.resolve(&path) {
                    self.emit(index, &path, message).await;
                    flushed += 1;
                }
            }
            self.retire(&path, &buffer);
            drop(guard);
        }
        flushed
    }

    async fn emit(&self, index: usize, path: &Path, message: String) {
        let Some(rules) = self.classifier.get(index) else {
            return;
        };
        if !rules.accepts(&message) {
            debug!(path = %path.display(), "message filtered");
            return;
        }

        let seq = {
            let mut seqs = self.seqs.lock();
            let seq = seqs.entry(path.to_path_buf()).or_insert(0);
            *seq += 1;
            *seq
        };

        let mut event = AggEvent {
            kind: rules.kind.clone(),
            host: self.host.clone(),
            path: path.to_path_buf(),
            message,
            seq,
            fields: Map::new(),
        };
        if rules.json {
            event.merge_json_body();
            if event.has_json_error() {
                debug!(path = %path.display(), seq, "message is not a JSON object, sending raw");
            }
        }

        debug!(path = %path.display(), kind = %event.kind, seq, "enqueue");
        tokio::select! {
            biased;
            () = self.abort.cancelled() => self.release_seq(path, seq),
            () = self.output.push(event) => {}
        }
    }

    /// Returns an unsent event's sequence number. Emits for one path are
    /// serialized, so `seq` is still the latest value.
    fn release_seq(&self, path: &Path, seq: u64) {
        let mut seqs = self.seqs.lock();
        if seqs.get(path) == Some(&seq) {
            if seq > 1 {
                seqs.insert(path.to_path_buf(), seq - 1);
            } else {
                seqs.remove(path);
            }
        }
        debug!(path = %path.display(), seq, "pipeline aborted, event not sent");
    }
}

/// Handle to a running aggregator.
pub struct Aggregator {
    assembler: Arc<Assembler>,
    capture_stop: CancellationToken,
    flush_stop: CancellationToken,
    capture: JoinHandle<()>,
    flush: JoinHandle<()>,
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("host", &self.assembler.host)
            .field("flush_interval", &self.assembler.flush_interval)
            .finish_non_exhaustive()
    }
}

impl Aggregator {
    /// Spawns the capture and flush tasks.
    ///
    /// `seqs` seeds the per-path sequence counters.
    pub fn start(
        config: AggregatorConfig,
        classifier: Arc<Classifier>,
        input: Arc<BoundedQueue<TailEvent>>,
        output: Arc<BoundedQueue<AggEvent>>,
        seqs: Seqs,
        abort: CancellationToken,
    ) -> Self {
        let capture_stop = abort.child_token();
        let flush_stop = abort.child_token();
        let flush_interval = config.flush_interval;

        let assembler = Arc::new(Assembler {
            classifier,
            host: config.host,
            flush_interval,
            types: Mutex::new(HashMap::new()),
            buffers: Mutex::new(HashMap::new()),
            seqs: Arc::new(Mutex::new(seqs)),
            output,
            abort,
        });

        info!(host = %assembler.host, flush_interval_ms = flush_interval.as_millis() as u64, "aggregator started");

        let capture = {
            let assembler = Arc::clone(&assembler);
            let stop = capture_stop.clone();
            tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        biased;
                        event = input.pop() => event,
                        () = stop.cancelled() => break,
                    };
                    assembler.capture(event).await;
                }
                if !assembler.abort.is_cancelled() {
                    while let Some(event) = input.try_pop() {
                        assembler.capture(event).await;
                    }
                }
            })
        };

        let flush = {
            let assembler = Arc::clone(&assembler);
            let stop = flush_stop.clone();
            tokio::spawn(async move {
                let mut ticker = interval(flush_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        () = stop.cancelled() => break,
                        _ = ticker.tick() => {
                            assembler.flush(false).await;
                        }
                    }
                }
                if !assembler.abort.is_cancelled() {
                    let flushed = assembler.flush(true).await;
                    debug!(flushed, "final flush");
                }
            })
        };

        Self {
            assembler,
            capture_stop,
            flush_stop,
            capture,
            flush,
        }
    }

    /// Returns a copy of the sequence counters.
    #[must_use]
    pub fn seqs(&self) -> Seqs {
        self.assembler.seqs.lock().clone()
    }

    /// Returns a shared handle to the live sequence counters.
    #[must_use]
    pub fn seqs_handle(&self) -> Arc<Mutex<Seqs>> {
        Arc::clone(&self.assembler.seqs)
    }

    /// Emits every buffered record now. Returns the number emitted.
    pub async fn flush_now(&self) -> usize {
        self.assembler.flush(true).await
    }

    /// Drains pending lines, flushes every buffer and returns the counters.
    pub async fn stop(self) -> Result<Seqs> {
        self.capture_stop.cancel();
        self.capture
            .await
            .map_err(|_| ShipError::StageAborted("aggregator capture"))?;
        self.flush_stop.cancel();
        self.flush
            .await
            .map_err(|_| ShipError::StageAborted("aggregator flush"))?;

        let seqs = self.assembler.seqs.lock().clone();
        info!(tracked = seqs.len(), "aggregator stopped");
        Ok(seqs)
    }
}
