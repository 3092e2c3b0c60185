//! Bounded multi-producer/multi-consumer queue used between pipeline stages.
//!
//! Every channel in the pipeline is a [`BoundedQueue`]. A full queue makes
//! `push` wait, which stalls the producing stage and propagates backpressure
//! upstream instead of buffering without limit.

use std::collections::VecDeque;
use std::fmt;
use std::pin::pin;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

use crate::error::QueueError;

/// Capacity limit of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// At most this many items are held at once.
    Bounded(usize),
    /// No limit; `push` never waits.
    Unbounded,
}

impl Capacity {
    const fn is_full(self, len: usize) -> bool {
        match self {
            Self::Bounded(max) => len >= max,
            Self::Unbounded => false,
        }
    }
}

impl Default for Capacity {
    fn default() -> Self {
        Self::Bounded(4096)
    }
}

/// A capacity-limited FIFO queue with waiting `push` and `pop`.
///
/// Waiters are woken one at a time. Dropping a pending `pop` or `push`
/// future never loses or duplicates an item.
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: Capacity,
    item_available: Notify,
    space_available: Notify,
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<T> BoundedQueue<T> {
    /// Creates a queue holding at most `capacity` items (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::with_capacity(Capacity::Bounded(capacity.max(1)))
    }

    /// Creates a queue with no capacity limit.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::with_capacity(Capacity::Unbounded)
    }

    /// Creates a queue with the given capacity setting.
    #[must_use]
    pub fn with_capacity(capacity: Capacity) -> Self {
        let capacity = match capacity {
            Capacity::Bounded(max) => Capacity::Bounded(max.max(1)),
            Capacity::Unbounded => Capacity::Unbounded,
        };
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
            item_available: Notify::new(),
            space_available: Notify::new(),
        }
    }

    /// Returns the capacity setting.
    #[must_use]
    pub const fn capacity(&self) -> Capacity {
        self.capacity
    }

    /// Returns the number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Returns true if no items are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Returns true if a `push` would currently wait.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.capacity.is_full(self.items.lock().len())
    }

    /// Enqueues without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Full`] with the item if the queue is at capacity.
    pub fn try_push(&self, item: T) -> Result<(), QueueError<T>> {
        let mut items = self.items.lock();
        if self.capacity.is_full(items.len()) {
            return Err(QueueError::Full(item));
        }
        items.push_back(item);
        let has_space = !self.capacity.is_full(items.len());
        drop(items);

        self.item_available.notify_one();
        if has_space {
            // Pass the wakeup along in case several producers were parked.
            self.space_available.notify_one();
        }
        Ok(())
    }

    /// Dequeues without waiting.
    pub fn try_pop(&self) -> Option<T> {
        let mut items = self.items.lock();
        let item = items.pop_front()?;
        let has_more = !items.is_empty();
        drop(items);

        self.space_available.notify_one();
        if has_more {
            self.item_available.notify_one();
        }
        Some(item)
    }

    /// Enqueues, waiting as long as the queue is full.
    pub async fn push(&self, item: T) {
        let mut item = item;
        loop {
            let mut notified = pin!(self.space_available.notified());
            notified.as_mut().enable();
            match self.try_push(item) {
                Ok(()) => return,
                Err(rejected) => item = rejected.into_inner(),
            }
            notified.await;
        }
    }

    /// Enqueues, waiting at most `timeout` for space.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Timeout`] with the item if no space became
    /// available before the deadline.
    pub async fn push_timeout(&self, item: T, timeout: Duration) -> Result<(), QueueError<T>> {
        let deadline = Instant::now() + timeout;
        let mut item = item;
        loop {
            let mut notified = pin!(self.space_available.notified());
            notified.as_mut().enable();
            match self.try_push(item) {
                Ok(()) => return Ok(()),
                Err(rejected) => item = rejected.into_inner(),
            }
            if timeout_at(deadline, notified).await.is_err() {
                return self
                    .try_push(item)
                    .map_err(|rejected| QueueError::Timeout {
                        item: rejected.into_inner(),
                        timeout,
                    });
            }
        }
    }

    /// Dequeues, waiting as long as the queue is empty.
    pub async fn pop(&self) -> T {
        loop {
            let mut notified = pin!(self.item_available.notified());
            notified.as_mut().enable();
            if let Some(item) = self.try_pop() {
                return item;
            }
            notified.await;
        }
    }

    /// Dequeues, waiting at most `timeout`. Returns `None` on timeout.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut notified = pin!(self.item_available.notified());
            notified.as_mut().enable();
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if timeout_at(deadline, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }

    /// Removes and returns everything currently queued.
    pub fn drain(&self) -> Vec<T> {
        let drained: Vec<T> = self.items.lock().drain(..).collect();
        if !drained.is_empty() {
            self.space_available.notify_waiters();
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn try_push_respects_capacity() {
        let queue = BoundedQueue::new(2);
        assert!(queue.try_push(1).is_ok());
        assert!(queue.try_push(2).is_ok());
        assert!(queue.is_full());
        assert_eq!(queue.try_push(3), Err(QueueError::Full(3)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn try_pop_is_fifo() {
        let queue = BoundedQueue::new(4);
        for i in 0..4 {
            assert!(queue.try_push(i).is_ok());
        }
        assert_eq!(queue.try_pop(), Some(0));
        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.drain(), vec![2, 3]);
        assert_eq!(queue.try_pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let queue = BoundedQueue::new(0);
        assert_eq!(queue.capacity(), Capacity::Bounded(1));
        assert!(queue.try_push("a").is_ok());
        assert!(queue.try_push("b").is_err());
    }

    #[test]
    fn unbounded_never_fills() {
        let queue = BoundedQueue::unbounded();
        for i in 0..10_000 {
            assert!(queue.try_push(i).is_ok());
        }
        assert!(!queue.is_full());
        assert_eq!(queue.len(), 10_000);
    }

    #[tokio::test]
    async fn push_blocks_until_pop() {
        let queue = Arc::new(BoundedQueue::new(1));
        queue.push("first").await;

        let pushed = Arc::new(AtomicBool::new(false));
        let producer = {
            let queue = Arc::clone(&queue);
            let pushed = Arc::clone(&pushed);
            tokio::spawn(async move {
                queue.push("second").await;
                pushed.store(true, Ordering::SeqCst);
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pushed.load(Ordering::SeqCst), "producer must wait while full");
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.pop().await, "first");
        producer.await.expect("producer task");
        assert!(pushed.load(Ordering::SeqCst));

        assert_eq!(queue.pop().await, "second");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let queue = Arc::new(BoundedQueue::new(8));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(42).await;
        assert_eq!(consumer.await.expect("consumer task"), 42);
    }

    #[tokio::test]
    async fn pop_timeout_returns_none_when_empty() {
        let queue: BoundedQueue<u8> = BoundedQueue::new(1);
        assert_eq!(queue.pop_timeout(Duration::from_millis(10)).await, None);
    }

    #[tokio::test]
    async fn push_timeout_hands_item_back() {
        let queue = BoundedQueue::new(1);
        queue.push(1).await;

        let result = queue.push_timeout(2, Duration::from_millis(10)).await;
        assert_eq!(
            result,
            Err(QueueError::Timeout {
                item: 2,
                timeout: Duration::from_millis(10),
            })
        );
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn cancelled_pop_loses_nothing() {
        let queue = Arc::new(BoundedQueue::new(4));

        // A pop that is abandoned before any item arrives.
        let abandoned = tokio::time::timeout(Duration::from_millis(10), queue.pop()).await;
        assert!(abandoned.is_err());

        queue.push(1).await;
        queue.push(2).await;
        assert_eq!(queue.pop().await, 1);
        assert_eq!(queue.pop().await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_producers_and_consumers_deliver_every_item_once() {
        let queue = Arc::new(BoundedQueue::new(3));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move {
                    for i in 0..250 {
                        queue.push(p * 1000 + i).await;
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    for _ in 0..500 {
                        seen.push(queue.pop().await);
                    }
                    seen
                })
            })
            .collect();

        for producer in producers {
            producer.await.expect("producer");
        }
        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await.expect("consumer"));
        }

        all.sort_unstable();
        let mut expected: Vec<i32> = (0..4)
            .flat_map(|p| (0..250).map(move |i| p * 1000 + i))
            .collect();
        expected.sort_unstable();
        assert_eq!(all, expected);
        assert!(queue.is_empty());
    }
}
