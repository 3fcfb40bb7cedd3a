//! Fixed-capacity FIFO queue with suspending put/take and one-shot close.
//!
//! ```text
//!   put ──▶ [VecDeque<T>, len <= capacity] ──▶ take
//!           ├── put suspends while full (backpressure)
//!           ├── take suspends while empty
//!           ├── close → pending/future puts fail, buffered items stay takeable
//!           └── closed + empty → take returns None ("finished")
//! ```
//!
//! The buffer lives behind a `std::sync::Mutex`: critical sections are single
//! `VecDeque` operations and never span an await. Waiters register on a tokio
//! `Notify` (`enable()`) *before* inspecting the buffer, so a wakeup sent
//! between the check and the await is never lost.

use crate::error::{ConfigError, PutError, QueueError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

struct QueueState<T> {
    buffer: VecDeque<T>,
    closed: bool,
}

/// Bounded multi-producer multi-consumer queue.
pub struct BoundedQueue<T> {
    state: Mutex<QueueState<T>>,
    capacity: usize,
    /// Signalled once per accepted put, and for everyone on close.
    not_empty: Notify,
    /// Signalled once per take, and for everyone on close.
    not_full: Notify,
    /// Mirror of `state.closed` for lock-free reads.
    closed: AtomicBool,
}

/// Outcome of a single non-suspending attempt.
enum Attempt<T> {
    Done(T),
    Wait,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::ZeroCapacity("queue".to_string()));
        }
        Ok(Self::with_min_capacity(capacity))
    }

    /// Like [`BoundedQueue::new`], raising a zero capacity to 1.
    pub(crate) fn with_min_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                buffer: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            capacity,
            not_empty: Notify::new(),
            not_full: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Maximum number of buffered items.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffered items at this instant.
    pub fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closed and fully drained: every take now returns `None`.
    pub fn is_finished(&self) -> bool {
        let state = self.lock();
        state.closed && state.buffer.is_empty()
    }

    /// Stop accepting items. Idempotent.
    ///
    /// Wakes every suspended putter (they fail with `Closed`) and every
    /// suspended taker (they drain what is left, then observe `None`).
    pub fn close(&self) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            self.closed.store(true, Ordering::Release);
        }
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    /// Append `item`, suspending while the queue is full.
    pub async fn put(&self, item: T) -> Result<(), PutError<T>> {
        self.put_until(item, None).await
    }

    /// Like [`put`](Self::put) but gives up after `timeout`, returning the item.
    pub async fn put_timeout(&self, item: T, timeout: Duration) -> Result<(), PutError<T>> {
        self.put_until(item, Some((Instant::now() + timeout, timeout))).await
    }

    /// Remove the head, suspending while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn take(&self) -> Option<T> {
        match self.take_until(None).await {
            Ok(item) => item,
            // No deadline was set, so the only exit is an item or `None`.
            Err(_) => None,
        }
    }

    /// Like [`take`](Self::take) but fails with `Timeout` after `timeout`.
    pub async fn take_timeout(&self, timeout: Duration) -> Result<Option<T>, QueueError> {
        self.take_until(Some((Instant::now() + timeout, timeout))).await
    }

    /// Non-suspending put. Fails with `Closed` or hands the item back if full.
    pub fn try_put(&self, item: T) -> Result<(), PutError<T>> {
        match self.attempt_put(item)? {
            None => Ok(()),
            Some(item) => Err(PutError::timeout(item, Duration::ZERO)),
        }
    }

    /// Non-suspending take.
    pub fn try_take(&self) -> Option<T> {
        match self.attempt_take() {
            Attempt::Done(item) => item,
            Attempt::Wait => None,
        }
    }

    async fn put_until(
        &self,
        item: T,
        deadline: Option<(Instant, Duration)>,
    ) -> Result<(), PutError<T>> {
        let mut item = item;
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            item = match self.attempt_put(item)? {
                None => return Ok(()),
                Some(rejected) => rejected,
            };

            match deadline {
                None => notified.await,
                Some((at, after)) => {
                    if tokio::time::timeout_at(at, notified).await.is_err() {
                        return Err(PutError::timeout(item, after));
                    }
                }
            }
        }
    }

    /// Ok(None) when accepted, Ok(Some(item)) when full.
    fn attempt_put(&self, item: T) -> Result<Option<T>, PutError<T>> {
        let mut state = self.lock();
        if state.closed {
            return Err(PutError::closed(item));
        }
        if state.buffer.len() >= self.capacity {
            return Ok(Some(item));
        }
        state.buffer.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(None)
    }

    async fn take_until(
        &self,
        deadline: Option<(Instant, Duration)>,
    ) -> Result<Option<T>, QueueError> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Attempt::Done(item) = self.attempt_take() {
                return Ok(item);
            }

            match deadline {
                None => notified.await,
                Some((at, after)) => {
                    if tokio::time::timeout_at(at, notified).await.is_err() {
                        return Err(QueueError::Timeout(after));
                    }
                }
            }
        }
    }

    fn attempt_take(&self) -> Attempt<Option<T>> {
        let mut state = self.lock();
        match state.buffer.pop_front() {
            Some(item) => {
                drop(state);
                self.not_full.notify_one();
                Attempt::Done(Some(item))
            }
            None if state.closed => Attempt::Done(None),
            None => Attempt::Wait,
        }
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.capacity)
            .field("len", &state.buffer.len())
            .field("closed", &state.closed)
            .finish()
    }
}

/// Type-erased close handle, used to force-close every queue of a pipeline.
pub trait Closeable: Send + Sync {
    fn close(&self);
    fn is_closed(&self) -> bool;
}

impl<T: Send> Closeable for BoundedQueue<T> {
    fn close(&self) {
        BoundedQueue::close(self);
    }

    fn is_closed(&self) -> bool {
        BoundedQueue::is_closed(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_zero_capacity_rejected() {
        let result = BoundedQueue::<u32>::new(0);
        assert!(matches!(result, Err(ConfigError::ZeroCapacity(_))));
    }

    #[tokio::test]
    async fn test_fifo_single_producer_single_consumer() {
        let queue = Arc::new(BoundedQueue::new(4).unwrap());

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                for i in 0..500u32 {
                    queue.put(i).await.unwrap();
                }
                queue.close();
            })
        };

        let mut taken = Vec::new();
        while let Some(item) = queue.take().await {
            taken.push(item);
        }
        producer.await.unwrap();

        assert_eq!(taken, (0..500).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_put_after_close_fails_and_returns_item() {
        let queue = BoundedQueue::new(2).unwrap();
        queue.close();

        let err = queue.put("late").await.unwrap_err();
        assert!(err.is_closed());
        assert_eq!(err.into_inner(), "late");
    }

    #[tokio::test]
    async fn test_buffered_items_drain_after_close() {
        let queue = BoundedQueue::new(3).unwrap();
        queue.put(1).await.unwrap();
        queue.put(2).await.unwrap();
        queue.close();

        assert!(queue.is_closed());
        assert!(!queue.is_finished());
        assert_eq!(queue.take().await, Some(1));
        assert_eq!(queue.take().await, Some(2));
        assert_eq!(queue.take().await, None);
        assert_eq!(queue.take().await, None);
        assert!(queue.is_finished());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let queue = BoundedQueue::<u8>::new(1).unwrap();
        queue.close();
        queue.close();
        assert!(queue.is_closed());
        assert_eq!(queue.take().await, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_wakes_all_blocked_takers() {
        let queue = Arc::new(BoundedQueue::<u32>::new(1).unwrap());

        let takers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.take().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        for taker in takers {
            let result = tokio::time::timeout(Duration::from_secs(2), taker)
                .await
                .expect("taker should wake on close")
                .unwrap();
            assert_eq!(result, None);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_wakes_blocked_putters() {
        let queue = Arc::new(BoundedQueue::new(1).unwrap());
        queue.put(0u32).await.unwrap();

        let putters: Vec<_> = (1..4u32)
            .map(|i| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.put(i).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        for putter in putters {
            let result = tokio::time::timeout(Duration::from_secs(2), putter)
                .await
                .expect("putter should wake on close")
                .unwrap();
            assert!(result.unwrap_err().is_closed());
        }
        // The item accepted before close is still there.
        assert_eq!(queue.take().await, Some(0));
        assert_eq!(queue.take().await, None);
    }

    #[tokio::test]
    async fn test_put_timeout_returns_item_when_full() {
        let queue = BoundedQueue::new(1).unwrap();
        queue.put(1).await.unwrap();

        let err = queue
            .put_timeout(2, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind, QueueError::Timeout(Duration::from_millis(20)));
        assert_eq!(err.into_inner(), 2);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_take_timeout_on_empty_queue() {
        let queue = BoundedQueue::<u32>::new(1).unwrap();
        let result = queue.take_timeout(Duration::from_millis(20)).await;
        assert_eq!(result, Err(QueueError::Timeout(Duration::from_millis(20))));

        queue.put(9).await.unwrap();
        assert_eq!(queue.take_timeout(Duration::from_millis(20)).await, Ok(Some(9)));

        queue.close();
        assert_eq!(queue.take_timeout(Duration::from_millis(20)).await, Ok(None));
    }

    #[test]
    fn test_try_put_and_try_take() {
        let queue = BoundedQueue::new(1).unwrap();
        assert!(queue.try_put(1).is_ok());
        let full = queue.try_put(2).unwrap_err();
        assert!(!full.is_closed());
        assert_eq!(full.into_inner(), 2);

        assert_eq!(queue.try_take(), Some(1));
        assert_eq!(queue.try_take(), None);

        queue.close();
        assert!(queue.try_put(3).unwrap_err().is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_backpressure_never_exceeds_capacity() {
        const CAPACITY: usize = 3;
        let queue = Arc::new(BoundedQueue::new(CAPACITY).unwrap());

        let producers: Vec<_> = (0..4u32)
            .map(|p| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    for i in 0..250u32 {
                        queue.put(p * 1000 + i).await.unwrap();
                        assert!(queue.len() <= CAPACITY);
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    while let Some(item) = queue.take().await {
                        assert!(queue.len() <= CAPACITY);
                        seen.push(item);
                    }
                    seen
                })
            })
            .collect();

        for producer in producers {
            producer.await.unwrap();
        }
        queue.close();

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await.unwrap());
        }

        assert_eq!(all.len(), 1000);
        let unique: HashSet<_> = all.iter().copied().collect();
        assert_eq!(unique.len(), 1000, "no item may be duplicated");
        for p in 0..4u32 {
            for i in 0..250u32 {
                assert!(unique.contains(&(p * 1000 + i)), "item lost");
            }
        }
    }

    #[test]
    fn test_debug_reports_state() {
        let queue = BoundedQueue::<u8>::new(2).unwrap();
        let debug = format!("{:?}", queue);
        assert!(debug.contains("capacity: 2"));
        assert!(debug.contains("closed: false"));
    }
}
