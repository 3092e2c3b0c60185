//! Incremental file reading driven by watch events.
//!
//! This module provides:
//! - Lazily opened, cursor-positioned file handles per path
//! - Bounded chunked reads up to the size carried by each event
//! - Line splitting with a buffered trailing partial line
//! - Eviction of idle handles on a separate interval
//!
//! The committed cursor for a path is the read position minus the bytes of
//! any buffered partial line, so resuming from it never loses a line.

use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, ShipError};
use crate::lines::LineSplitter;
use crate::queue::BoundedQueue;
use crate::types::{TailEvent, WatchEvent};

/// Committed read offsets per path.
pub type Cursors = HashMap<PathBuf, u64>;

/// Tail stage settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailConfig {
    /// Idle time after which a file handle is closed.
    pub eviction_interval: Duration,
    /// Maximum bytes per read call.
    pub block_size: usize,
    /// A single event needing more bytes than this logs a warning.
    pub large_read_warn: u64,
    /// Longest partial line tolerated before failing.
    pub max_line_length: usize,
    /// Emit the partial line on truncate/replace instead of discarding it.
    pub flush_partial_on_reset: bool,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            eviction_interval: Duration::from_secs(5),
            block_size: 32 * 1024,
            large_read_warn: 16 * 1024,
            max_line_length: 1024 * 1024,
            flush_partial_on_reset: false,
        }
    }
}

impl TailConfig {
    /// Sets the eviction interval.
    #[must_use]
    pub const fn with_eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval = interval;
        self
    }

    /// Sets the read block size (minimum 1).
    #[must_use]
    pub fn with_block_size(mut self, size: usize) -> Self {
        self.block_size = size.max(1);
        self
    }

    /// Sets the large read warning threshold.
    #[must_use]
    pub const fn with_large_read_warn(mut self, bytes: u64) -> Self {
        self.large_read_warn = bytes;
        self
    }

    /// Sets the maximum partial line length.
    #[must_use]
    pub const fn with_max_line_length(mut self, bytes: usize) -> Self {
        self.max_line_length = bytes;
        self
    }

    /// Sets whether a partial line is emitted on reset.
    #[must_use]
    pub const fn with_flush_partial_on_reset(mut self, flush: bool) -> Self {
        self.flush_partial_on_reset = flush;
        self
    }
}

#[derive(Debug)]
struct Handle {
    file: Option<File>,
    reading: bool,
    last_active: Instant,
}

/// State shared between the event handler and the evictor.
#[derive(Debug, Default)]
struct Shared {
    handles: Mutex<HashMap<PathBuf, Handle>>,
    cursors: Arc<Mutex<Cursors>>,
}

impl Shared {
    /// Marks the path as being read and takes its open file, if any.
    fn checkout(&self, path: &Path) -> Option<File> {
        let mut handles = self.handles.lock();
        let handle = handles.entry(path.to_path_buf()).or_insert_with(|| Handle {
            file: None,
            reading: true,
            last_active: Instant::now(),
        });
        handle.reading = true;
        handle.file.take()
    }

    /// Returns the file after a read. `None` drops the handle entirely.
    fn release(&self, path: &Path, file: Option<File>) {
        let mut handles = self.handles.lock();
        match file {
            Some(file) => {
                handles.insert(
                    path.to_path_buf(),
                    Handle {
                        file: Some(file),
                        reading: false,
                        last_active: Instant::now(),
                    },
                );
            }
            None => {
                handles.remove(path);
            }
        }
    }

    fn close(&self, path: &Path) {
        if self.handles.lock().remove(path).is_some() {
            debug!(path = %path.display(), "closed");
        }
    }

    fn evict(&self, idle: Duration) -> usize {
        let mut handles = self.handles.lock();
        let before = handles.len();
        handles.retain(|path, handle| {
            let keep = handle.reading || handle.last_active.elapsed() < idle;
            if !keep {
                debug!(path = %path.display(), "evicted");
            }
            keep
        });
        before - handles.len()
    }

    fn commit(&self, path: &Path, cursor: u64) {
        self.cursors.lock().insert(path.to_path_buf(), cursor);
    }
}

/// Handle to a running tail stage.
#[derive(Debug)]
pub struct Tail {
    stop: CancellationToken,
    handler: JoinHandle<Result<()>>,
    evictor: JoinHandle<()>,
    shared: Arc<Shared>,
}

impl Tail {
    /// Spawns the event handler and the evictor.
    ///
    /// `cursors` seeds the read offsets. A fatal error cancels `abort`,
    /// which also stops this stage.
    pub fn start(
        config: TailConfig,
        input: Arc<BoundedQueue<WatchEvent>>,
        output: Arc<BoundedQueue<TailEvent>>,
        cursors: Cursors,
        abort: CancellationToken,
    ) -> Self {
        let shared = Arc::new(Shared {
            handles: Mutex::new(HashMap::new()),
            cursors: Arc::new(Mutex::new(cursors)),
        });
        let stop = abort.child_token();

        let evictor = {
            let shared = Arc::clone(&shared);
            let stop = stop.clone();
            let idle = config.eviction_interval;
            tokio::spawn(async move {
                let mut ticker = interval(idle);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        () = stop.cancelled() => break,
                        _ = ticker.tick() => {
                            let evicted = shared.evict(idle);
                            if evicted > 0 {
                                debug!(evicted, "idle handles closed");
                            }
                        }
                    }
                }
            })
        };

        let reader = Reader {
            config,
            shared: Arc::clone(&shared),
            output,
            abort,
            paths: HashMap::new(),
        };
        let handler = {
            let stop = stop.clone();
            tokio::spawn(async move { reader.run(input, stop).await })
        };

        Self {
            stop,
            handler,
            evictor,
            shared,
        }
    }

    /// Returns a copy of the committed cursors.
    #[must_use]
    pub fn cursors(&self) -> Cursors {
        self.shared.cursors.lock().clone()
    }

    /// Returns a shared handle to the live cursor map.
    #[must_use]
    pub fn cursors_handle(&self) -> Arc<Mutex<Cursors>> {
        Arc::clone(&self.shared.cursors)
    }

    /// Number of file handles currently open.
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.shared
            .handles
            .lock()
            .values()
            .filter(|h| h.file.is_some() || h.reading)
            .count()
    }

    /// Drains pending events, stops both tasks and returns the cursors.
    ///
    /// # Errors
    ///
    /// Returns the fatal error that stopped the handler, if any.
    pub async fn stop(self) -> Result<Cursors> {
        self.stop.cancel();
        let handled = self
            .handler
            .await
            .map_err(|_| ShipError::StageAborted("tail"))?;
        self.evictor
            .await
            .map_err(|_| ShipError::StageAborted("tail"))?;
        handled?;
        Ok(self.shared.cursors.lock().clone())
    }
}

#[derive(Debug, Default)]
struct PathReader {
    pos: u64,
    splitter: LineSplitter,
}

struct Reader {
    config: TailConfig,
    shared: Arc<Shared>,
    output: Arc<BoundedQueue<TailEvent>>,
    abort: CancellationToken,
    paths: HashMap<PathBuf, PathReader>,
}

impl Reader {
    async fn run(
        mut self,
        input: Arc<BoundedQueue<WatchEvent>>,
        stop: CancellationToken,
    ) -> Result<()> {
        info!(block_size = self.config.block_size, "tail started");

        loop {
            let event = tokio::select! {
                biased;
                event = input.pop() => event,
                () = stop.cancelled() => break,
            };
            self.dispatch(event).await?;
        }

        if !self.abort.is_cancelled() {
            while let Some(event) = input.try_pop() {
                self.dispatch(event).await?;
            }
        }

        info!(tracked = self.paths.len(), "tail stopped");
        Ok(())
    }

    async fn dispatch(&mut self, event: WatchEvent) -> Result<()> {
        if let Err(e) = self.handle(event).await {
            error!(error = %e, "tail failed");
            self.abort.cancel();
            return Err(e);
        }
        Ok(())
    }

    async fn handle(&mut self, event: WatchEvent) -> Result<()> {
        debug!(path = %event.path().display(), kind = %event.kind(), size = event.size(), "watch event");
        match event {
            WatchEvent::Created { .. } => Ok(()),
            WatchEvent::Appended { path, size } => self.read(&path, size).await,
            WatchEvent::Replaced { path, size } | WatchEvent::Truncated { path, size } => {
                self.reset(&path).await;
                self.read(&path, size).await
            }
            WatchEvent::Deleted { path } => {
                self.shared.close(&path);
                self.paths.remove(&path);
                self.shared.cursors.lock().remove(&path);
                Ok(())
            }
        }
    }

    /// Closes the handle and rewinds the path to offset zero.
    async fn reset(&mut self, path: &Path) {
        self.shared.close(path);
        let partial = self
            .paths
            .get_mut(path)
            .and_then(|state| state.splitter.take_pending());
        if let (Some(line), true) = (partial, self.config.flush_partial_on_reset) {
            self.emit(path, line).await;
        }
        self.paths.insert(path.to_path_buf(), PathReader::default());
        self.shared.commit(path, 0);
    }

    fn state_for(&mut self, path: &Path) -> &mut PathReader {
        let shared = &self.shared;
        self.paths.entry(path.to_path_buf()).or_insert_with(|| PathReader {
            pos: shared.cursors.lock().get(path).copied().unwrap_or(0),
            splitter: LineSplitter::new(),
        })
    }

    async fn read(&mut self, path: &Path, size: u64) -> Result<()> {
        let pos = self.state_for(path).pos;
        if pos >= size {
            return Ok(());
        }

        let needed = size - pos;
        if needed > self.config.large_read_warn {
            warn!(path = %path.display(), cursor = pos, size, bytes = needed, "large read");
        }

        let file = match self.shared.checkout(path) {
            Some(file) => file,
            None => match open_at(path, pos).await {
                Ok(file) => {
                    debug!(path = %path.display(), cursor = pos, "opened");
                    file
                }
                Err(e) => {
                    if e.kind() == io::ErrorKind::NotFound {
                        debug!(path = %path.display(), "vanished before open");
                    } else {
                        warn!(path = %path.display(), error = %e, "open failed");
                    }
                    self.shared.release(path, None);
                    return Ok(());
                }
            },
        };

        let (file, result) = self.read_range(path, file, size).await;
        self.shared.release(path, file);
        result
    }

    /// Reads from the current position up to `size`. Returns the file to
    /// keep open (if still usable) together with the outcome.
    async fn read_range(
        &mut self,
        path: &Path,
        mut file: File,
        size: u64,
    ) -> (Option<File>, Result<()>) {
        let block_size = self.config.block_size;
        let max_line = self.config.max_line_length;
        let mut buf = vec![0; block_size];

        loop {
            let pos = self.state_for(path).pos;
            if pos >= size {
                return (Some(file), Ok(()));
            }

            let want = usize::try_from(size - pos).map_or(block_size, |n| n.min(block_size));
            let n = match file.read(&mut buf[..want]).await {
                Ok(n) => n,
                Err(e) => {
                    if e.kind() == io::ErrorKind::NotFound {
                        debug!(path = %path.display(), cursor = pos, "vanished mid-read");
                    } else {
                        warn!(path = %path.display(), cursor = pos, error = %e, "read failed");
                    }
                    return (None, Ok(()));
                }
            };

            if n == 0 {
                let on_disk = file.metadata().await.map(|m| m.len()).unwrap_or(0);
                return match check_early_eof(path, pos, size, on_disk) {
                    Ok(()) => {
                        debug!(path = %path.display(), cursor = pos, size, on_disk, "file shrank during read");
                        (Some(file), Ok(()))
                    }
                    Err(e) => (None, Err(e)),
                };
            }

            let state = self.state_for(path);
            state.pos += n as u64;
            let lines = state.splitter.extract(&buf[..n]);
            let pending = state.splitter.pending_len();
            let committed = state.pos - pending as u64;

            for line in lines {
                if !self.emit(path, line).await {
                    return (Some(file), Ok(()));
                }
            }

            if pending > max_line {
                return (
                    None,
                    Err(ShipError::LineTooLong {
                        path: path.to_path_buf(),
                        limit: max_line,
                    }),
                );
            }
            self.shared.commit(path, committed);
        }
    }

    /// Pushes a line downstream. Returns false if the pipeline was aborted.
    async fn emit(&self, path: &Path, line: String) -> bool {
        let event = TailEvent::new(path, line);
        tokio::select! {
            biased;
            () = self.abort.cancelled() => false,
            () = self.output.push(event) => true,
        }
    }
}

/// End of file at `pos` before `size` is only benign when the file shrank
/// below `size`; a forthcoming truncate event reconciles it.
fn check_early_eof(path: &Path, pos: u64, size: u64, on_disk: u64) -> Result<()> {
    if on_disk >= size {
        return Err(ShipError::ShortRead {
            path: path.to_path_buf(),
            expected: size,
            actual: pos,
        });
    }
    Ok(())
}

async fn open_at(path: &Path, pos: u64) -> io::Result<File> {
    let mut file = File::open(path).await?;
    if pos > 0 {
        file.seek(SeekFrom::Start(pos)).await?;
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;

    struct Harness {
        tail: Tail,
        input: Arc<BoundedQueue<WatchEvent>>,
        output: Arc<BoundedQueue<TailEvent>>,
        abort: CancellationToken,
    }

    fn harness(config: TailConfig, cursors: Cursors) -> Harness {
        let input = Arc::new(BoundedQueue::new(64));
        let output = Arc::new(BoundedQueue::unbounded());
        let abort = CancellationToken::new();
        let tail = Tail::start(
            config,
            Arc::clone(&input),
            Arc::clone(&output),
            cursors,
            abort.clone(),
        );
        Harness {
            tail,
            input,
            output,
            abort,
        }
    }

    fn append(path: &Path, data: &[u8]) -> u64 {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("open for append");
        file.write_all(data).expect("append");
        file.metadata().expect("metadata").len()
    }

    async fn lines(output: &BoundedQueue<TailEvent>, count: usize) -> Vec<String> {
        let mut lines = Vec::new();
        for _ in 0..count {
            let event = output
                .pop_timeout(Duration::from_secs(2))
                .await
                .expect("tail event");
            lines.push(event.line);
        }
        lines
    }

    // ==================== Reading ====================

    #[tokio::test]
    async fn appended_emits_lines_and_advances_cursor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.log");
        let size = append(&path, b"Hello, world!\n");

        let h = harness(TailConfig::default(), Cursors::new());
        h.input.push(WatchEvent::Created { path: path.clone() }).await;
        h.input.push(WatchEvent::Appended { path: path.clone(), size }).await;

        assert_eq!(lines(&h.output, 1).await, vec!["Hello, world!"]);
        let cursors = h.tail.stop().await.expect("stop");
        assert_eq!(cursors.get(&path), Some(&14));
    }

    #[tokio::test]
    async fn partial_line_is_held_and_excluded_from_cursor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.log");
        let size = append(&path, b"one\ntw");

        let h = harness(TailConfig::default().with_block_size(3), Cursors::new());
        h.input.push(WatchEvent::Appended { path: path.clone(), size }).await;
        assert_eq!(lines(&h.output, 1).await, vec!["one"]);

        let size = append(&path, b"o\n");
        h.input.push(WatchEvent::Appended { path: path.clone(), size }).await;
        assert_eq!(lines(&h.output, 1).await, vec!["two"]);

        let cursors = h.tail.stop().await.expect("stop");
        assert_eq!(cursors.get(&path), Some(&8));
    }

    #[tokio::test]
    async fn checkpointed_cursor_skips_partial_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.log");
        let size = append(&path, b"done\npart");

        let h = harness(TailConfig::default(), Cursors::new());
        h.input.push(WatchEvent::Appended { path: path.clone(), size }).await;
        assert_eq!(lines(&h.output, 1).await, vec!["done"]);
        let cursors = h.tail.stop().await.expect("stop");
        assert_eq!(cursors.get(&path), Some(&5));

        // A restart from that cursor re-reads the partial line in full.
        let size = append(&path, b"ial\n");
        let h = harness(TailConfig::default(), cursors);
        h.input.push(WatchEvent::Appended { path: path.clone(), size }).await;
        assert_eq!(lines(&h.output, 1).await, vec!["partial"]);
        let cursors = h.tail.stop().await.expect("stop");
        assert_eq!(cursors.get(&path), Some(&size));
    }

    #[tokio::test]
    async fn truncate_rereads_from_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.log");
        let size = append(&path, b"Hello, world!\n");

        let h = harness(TailConfig::default(), Cursors::new());
        h.input.push(WatchEvent::Appended { path: path.clone(), size }).await;
        assert_eq!(lines(&h.output, 1).await, vec!["Hello, world!"]);

        std::fs::write(&path, b"Bye!\n").expect("rewrite");
        h.input.push(WatchEvent::Truncated { path: path.clone(), size: 5 }).await;
        assert_eq!(lines(&h.output, 1).await, vec!["Bye!"]);

        let cursors = h.tail.stop().await.expect("stop");
        assert_eq!(cursors.get(&path), Some(&5));
    }

    #[tokio::test]
    async fn truncate_to_zero_then_append() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.log");
        let size = append(&path, b"Hello, world!\n");

        let h = harness(TailConfig::default(), Cursors::new());
        h.input.push(WatchEvent::Appended { path: path.clone(), size }).await;
        assert_eq!(lines(&h.output, 1).await, vec!["Hello, world!"]);

        std::fs::write(&path, b"").expect("truncate");
        h.input.push(WatchEvent::Truncated { path: path.clone(), size: 0 }).await;
        let size = append(&path, b"Bye!\n");
        h.input.push(WatchEvent::Appended { path: path.clone(), size }).await;
        assert_eq!(lines(&h.output, 1).await, vec!["Bye!"]);

        let cursors = h.tail.stop().await.expect("stop");
        assert_eq!(cursors.get(&path), Some(&5));
    }

    #[tokio::test]
    async fn reset_discards_or_flushes_partial_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.log");

        for flush in [false, true] {
            std::fs::write(&path, b"").expect("reset file");
            let size = append(&path, b"full\nhalf");
            let h = harness(
                TailConfig::default().with_flush_partial_on_reset(flush),
                Cursors::new(),
            );
            h.input.push(WatchEvent::Appended { path: path.clone(), size }).await;
            assert_eq!(lines(&h.output, 1).await, vec!["full"]);

            std::fs::write(&path, b"new\n").expect("rewrite");
            h.input.push(WatchEvent::Truncated { path: path.clone(), size: 4 }).await;

            let expected: Vec<&str> = if flush { vec!["half", "new"] } else { vec!["new"] };
            assert_eq!(lines(&h.output, expected.len()).await, expected);
            h.tail.stop().await.expect("stop");
            assert!(h.output.is_empty());
        }
    }

    #[tokio::test]
    async fn deleted_forgets_cursor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.log");
        let size = append(&path, b"a\n");

        let h = harness(TailConfig::default(), Cursors::new());
        h.input.push(WatchEvent::Appended { path: path.clone(), size }).await;
        assert_eq!(lines(&h.output, 1).await, vec!["a"]);

        std::fs::remove_file(&path).expect("remove");
        h.input.push(WatchEvent::Deleted { path: path.clone() }).await;

        // Recreated file is read from the beginning.
        let size = append(&path, b"b\n");
        h.input.push(WatchEvent::Created { path: path.clone() }).await;
        h.input.push(WatchEvent::Appended { path: path.clone(), size }).await;
        assert_eq!(lines(&h.output, 1).await, vec!["b"]);

        let cursors = h.tail.stop().await.expect("stop");
        assert_eq!(cursors.get(&path), Some(&2));
    }

    #[tokio::test]
    async fn missing_file_abandons_read() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gone.log");

        let h = harness(TailConfig::default(), Cursors::new());
        h.input.push(WatchEvent::Appended { path: path.clone(), size: 10 }).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(h.output.is_empty());
        assert_eq!(h.tail.open_handles(), 0);
        let cursors = h.tail.stop().await.expect("stop");
        assert!(!cursors.contains_key(&path));
    }

    #[tokio::test]
    async fn shrunken_file_abandons_read() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.log");
        append(&path, b"abc\n");

        let h = harness(TailConfig::default(), Cursors::new());
        h.input.push(WatchEvent::Appended { path: path.clone(), size: 100 }).await;
        assert_eq!(lines(&h.output, 1).await, vec!["abc"]);

        let cursors = h.tail.stop().await.expect("stop");
        assert_eq!(cursors.get(&path), Some(&4));
        assert!(!h.abort.is_cancelled());
    }

    // ==================== Failure ====================

    #[tokio::test]
    async fn overlong_partial_line_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.log");
        let size = append(&path, &[b'x'; 64]);

        let h = harness(
            TailConfig::default().with_max_line_length(16).with_block_size(8),
            Cursors::new(),
        );
        h.input.push(WatchEvent::Appended { path: path.clone(), size }).await;

        tokio::time::timeout(Duration::from_secs(2), h.abort.cancelled())
            .await
            .expect("abort signalled");
        let err = h.tail.stop().await.unwrap_err();
        assert!(matches!(err, ShipError::LineTooLong { limit: 16, .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn early_eof_with_full_length_file_is_short_read() {
        let path = Path::new("/logs/app.log");
        let err = check_early_eof(path, 4, 10, 10).unwrap_err();
        assert!(matches!(
            err,
            ShipError::ShortRead { expected: 10, actual: 4, .. }
        ));
        assert!(err.is_fatal());
        assert!(check_early_eof(path, 4, 10, 64).is_err());
    }

    #[test]
    fn early_eof_after_shrink_is_benign() {
        let path = Path::new("/logs/app.log");
        assert!(check_early_eof(path, 4, 10, 9).is_ok());
        assert!(check_early_eof(path, 4, 10, 0).is_ok());
    }

    // ==================== Eviction ====================

    #[test]
    fn evict_keeps_handles_being_read() {
        let shared = Shared::default();
        shared.commit(Path::new("/logs/busy.log"), 7);
        {
            let mut handles = shared.handles.lock();
            for (path, reading) in [("/logs/busy.log", true), ("/logs/idle.log", false)] {
                handles.insert(
                    PathBuf::from(path),
                    Handle {
                        file: None,
                        reading,
                        last_active: Instant::now(),
                    },
                );
            }
        }

        assert_eq!(shared.evict(Duration::ZERO), 1);
        let handles = shared.handles.lock();
        assert!(handles.contains_key(Path::new("/logs/busy.log")));
        assert!(!handles.contains_key(Path::new("/logs/idle.log")));
        assert_eq!(shared.cursors.lock().get(Path::new("/logs/busy.log")), Some(&7));
    }

    #[test]
    fn checked_out_handle_survives_eviction_until_released() {
        let shared = Shared::default();
        let path = Path::new("/logs/app.log");
        assert!(shared.checkout(path).is_none());
        assert_eq!(shared.evict(Duration::ZERO), 0);

        shared.release(path, None);
        assert!(shared.handles.lock().is_empty());
    }

    #[tokio::test]
    async fn idle_handles_are_evicted_and_reopened_at_cursor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.log");
        let size = append(&path, b"first\n");

        let h = harness(
            TailConfig::default().with_eviction_interval(Duration::from_millis(30)),
            Cursors::new(),
        );
        h.input.push(WatchEvent::Appended { path: path.clone(), size }).await;
        assert_eq!(lines(&h.output, 1).await, vec!["first"]);
        assert_eq!(h.tail.open_handles(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.tail.open_handles(), 0);
        assert_eq!(h.tail.cursors().get(&path), Some(&6));

        let size = append(&path, b"second\n");
        h.input.push(WatchEvent::Appended { path: path.clone(), size }).await;
        assert_eq!(lines(&h.output, 1).await, vec!["second"]);
        h.tail.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn stop_drains_queued_events() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.log");
        let size = append(&path, b"a\nb\nc\n");

        let h = harness(TailConfig::default(), Cursors::new());
        h.input.push(WatchEvent::Appended { path: path.clone(), size }).await;
        let cursors = h.tail.stop().await.expect("stop");

        assert_eq!(cursors.get(&path), Some(&6));
        assert_eq!(h.output.len(), 3);
    }

    // ==================== Properties ====================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn any_append_sequence_reads_every_line(
            batches in prop::collection::vec(prop::collection::vec("[a-z]{0,10}", 1..5), 1..6),
            block_size in 1usize..16,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("runtime");

            let (emitted, cursor, size, expected) = runtime.block_on(async {
                let dir = tempfile::tempdir().expect("tempdir");
                let path = dir.path().join("app.log");
                let h = harness(TailConfig::default().with_block_size(block_size), Cursors::new());

                let mut expected = Vec::new();
                let mut size = 0;
                for batch in &batches {
                    let mut data = String::new();
                    for line in batch {
                        data.push_str(line);
                        data.push('\n');
                        expected.push(line.clone());
                    }
                    size = append(&path, data.as_bytes());
                    h.input.push(WatchEvent::Appended { path: path.clone(), size }).await;
                }

                let cursors = h.tail.stop().await.expect("stop");
                let emitted: Vec<String> = h.output.drain().into_iter().map(|e| e.line).collect();
                (emitted, cursors.get(&path).copied(), size, expected)
            });

            prop_assert_eq!(emitted, expected);
            prop_assert_eq!(cursor, Some(size));
        }
    }
}
