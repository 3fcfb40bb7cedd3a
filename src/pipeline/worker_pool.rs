//! N workers draining one shared bounded queue.
//!
//! Every worker runs the same loop: take an item, hand it to the [`Worker`],
//! repeat until the queue is closed and drained (or the pool is cancelled).
//! The worker that brings the active count to zero calls
//! [`Worker::on_drained`] exactly once; stages use this to close their output.

use crate::error::{panic_message, ConfigError, PutError, TransformFailure};
use crate::pipeline::failure::{FailureLog, FailureSink, ResultCollector};
use crate::queue::BoundedQueue;
use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Whether a worker keeps pulling after handling an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Per-item behaviour shared by all workers of a pool.
#[async_trait]
pub trait Worker<T>: Send + Sync + 'static {
    async fn process(&self, item: T) -> Flow;

    /// Called once, by whichever worker exits last.
    fn on_drained(&self) {}
}

/// Why a worker loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The queue was closed and empty.
    Drained,
    /// The cancellation token fired.
    Cancelled,
    /// The worker asked to stop (e.g. downstream closed).
    Stopped,
}

/// Final state of one worker.
#[derive(Debug, Clone)]
pub struct WorkerExit {
    pub worker: usize,
    pub processed: u64,
    pub reason: ExitReason,
}

/// Outcome of a whole pool once every worker has exited.
#[derive(Debug, Clone, Default)]
pub struct PoolExit {
    pub name: String,
    pub workers: usize,
    /// Items taken across all workers.
    pub processed: u64,
    pub cancelled_workers: usize,
    /// Worker tasks that panicked outside the per-item handler.
    pub panicked_workers: usize,
}

/// Decrements the active count on drop, so a panicking worker still counts
/// as exited and the drain callback still fires.
struct ActiveGuard<T, W: Worker<T>> {
    active: Arc<AtomicUsize>,
    worker: Arc<W>,
    _item: PhantomData<fn(T)>,
}

impl<T, W: Worker<T>> Drop for ActiveGuard<T, W> {
    fn drop(&mut self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.worker.on_drained();
        }
    }
}

/// A fixed set of workers consuming one queue.
pub struct WorkerPool<T> {
    name: String,
    queue: Arc<BoundedQueue<T>>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<WorkerExit>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawn `workers` tasks pulling from `queue` into `worker`.
    pub fn spawn<W>(
        name: impl Into<String>,
        workers: usize,
        queue: Arc<BoundedQueue<T>>,
        cancel: CancellationToken,
        worker: Arc<W>,
    ) -> Result<Self, ConfigError>
    where
        W: Worker<T>,
    {
        let name = name.into();
        if workers == 0 {
            return Err(ConfigError::ZeroWorkers(name));
        }

        let active = Arc::new(AtomicUsize::new(workers));
        let handles = (0..workers)
            .map(|id| {
                let guard = ActiveGuard {
                    active: active.clone(),
                    worker: worker.clone(),
                    _item: PhantomData,
                };
                tokio::spawn(worker_loop(
                    id,
                    name.clone(),
                    queue.clone(),
                    cancel.clone(),
                    worker.clone(),
                    guard,
                ))
            })
            .collect();

        tracing::debug!("Pool '{}' started {} workers", name, workers);

        Ok(Self {
            name,
            queue,
            cancel,
            handles,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    /// The shared queue producers put into.
    pub fn queue(&self) -> &Arc<BoundedQueue<T>> {
        &self.queue
    }

    /// Enqueue one item, suspending while the queue is full.
    pub async fn put(&self, item: T) -> Result<(), PutError<T>> {
        self.queue.put(item).await
    }

    /// Mark production as finished. Call once, after every producer is done.
    pub fn complete_adding(&self) {
        self.queue.close();
    }

    /// Stop workers at their next suspension point and close the queue.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.queue.close();
    }

    /// Wait for every worker to exit.
    pub async fn join(self) -> PoolExit {
        let mut exit = PoolExit {
            name: self.name,
            workers: self.handles.len(),
            ..Default::default()
        };

        for handle in self.handles {
            match handle.await {
                Ok(worker) => {
                    exit.processed += worker.processed;
                    if worker.reason == ExitReason::Cancelled {
                        exit.cancelled_workers += 1;
                    }
                }
                Err(e) => {
                    tracing::error!("Worker of '{}' panicked: {}", exit.name, e);
                    exit.panicked_workers += 1;
                }
            }
        }

        exit
    }
}

async fn worker_loop<T, W>(
    id: usize,
    name: String,
    queue: Arc<BoundedQueue<T>>,
    cancel: CancellationToken,
    worker: Arc<W>,
    _guard: ActiveGuard<T, W>,
) -> WorkerExit
where
    T: Send + 'static,
    W: Worker<T>,
{
    let mut processed = 0;

    let reason = loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => break ExitReason::Cancelled,
            item = queue.take() => item,
        };

        let Some(item) = item else {
            break ExitReason::Drained;
        };
        processed += 1;

        if worker.process(item).await == Flow::Stop {
            break if cancel.is_cancelled() {
                ExitReason::Cancelled
            } else {
                ExitReason::Stopped
            };
        }
    };

    tracing::debug!("Worker {} of '{}' exiting ({:?}) after {} items", id, name, reason, processed);

    WorkerExit {
        worker: id,
        processed,
        reason,
    }
}

/// Standalone worker that applies a function and collects results.
struct Collect<F, R> {
    name: String,
    f: F,
    results: Arc<ResultCollector<R>>,
    failures: Arc<FailureLog>,
}

#[async_trait]
impl<T, R, F, Fut> Worker<T> for Collect<F, R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    async fn process(&self, item: T) -> Flow {
        let outcome = AssertUnwindSafe(async { (self.f)(item).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(anyhow::anyhow!("function panicked: {}", panic_message(panic.as_ref())))
            });

        match outcome {
            Ok(result) => self.results.push(result),
            Err(error) => self.failures.record(TransformFailure {
                stage: self.name.clone(),
                seq: None,
                error,
            }),
        }
        Flow::Continue
    }
}

/// A [`WorkerPool`] whose results land in an unordered collector.
///
/// Used directly for producer-consumer and master-worker patterns.
pub struct CollectingPool<T, R> {
    pool: WorkerPool<T>,
    results: Arc<ResultCollector<R>>,
    failures: Arc<FailureLog>,
}

/// Everything a [`CollectingPool`] produced.
#[derive(Debug)]
pub struct PoolReport<R> {
    pub exit: PoolExit,
    /// Results in completion order.
    pub results: Vec<R>,
    pub failures: Vec<TransformFailure>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Build a pool with its own queue of `capacity` that runs `f` on every
    /// item and collects the results.
    pub fn collecting<R, F, Fut>(
        name: impl Into<String>,
        workers: usize,
        capacity: usize,
        f: F,
    ) -> Result<CollectingPool<T, R>, ConfigError>
    where
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let name = name.into();
        let queue = Arc::new(
            BoundedQueue::new(capacity).map_err(|_| ConfigError::ZeroCapacity(name.clone()))?,
        );
        let results = Arc::new(ResultCollector::new());
        let failures = Arc::new(FailureLog::new());

        let worker = Arc::new(Collect {
            name: name.clone(),
            f,
            results: results.clone(),
            failures: failures.clone(),
        });
        let pool = WorkerPool::spawn(name, workers, queue, CancellationToken::new(), worker)?;

        Ok(CollectingPool {
            pool,
            results,
            failures,
        })
    }
}

impl<T: Send + 'static, R> CollectingPool<T, R> {
    pub fn queue(&self) -> &Arc<BoundedQueue<T>> {
        self.pool.queue()
    }

    pub async fn put(&self, item: T) -> Result<(), PutError<T>> {
        self.pool.put(item).await
    }

    pub fn complete_adding(&self) {
        self.pool.complete_adding();
    }

    pub fn cancel(&self) {
        self.pool.cancel();
    }

    /// Wait for the workers, then hand back results and failures.
    pub async fn join(self) -> PoolReport<R> {
        let exit = self.pool.join().await;
        PoolReport {
            exit,
            results: self.results.drain(),
            failures: self.failures.drain(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_three_workers_twelve_items() {
        let pool = WorkerPool::collecting("squares", 3, 4, |x: u32| async move {
            tokio::time::sleep(Duration::from_millis((x % 3) as u64)).await;
            Ok::<_, anyhow::Error>(x * x)
        })
        .unwrap();

        for i in 1..=12u32 {
            pool.put(i).await.unwrap();
        }
        pool.complete_adding();

        let report = tokio::time::timeout(Duration::from_secs(5), pool.join())
            .await
            .expect("every worker should exit");

        assert_eq!(report.exit.workers, 3);
        assert_eq!(report.exit.processed, 12);
        assert_eq!(report.exit.panicked_workers, 0);
        assert_eq!(report.results.len(), 12);
        let unique: HashSet<u32> = report.results.into_iter().collect();
        let expected: HashSet<u32> = (1..=12u32).map(|x| x * x).collect();
        assert_eq!(unique, expected);
        assert!(report.failures.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_producers() {
        let pool = Arc::new(
            WorkerPool::collecting("sum", 2, 2, |x: u64| async move { Ok::<_, anyhow::Error>(x) })
                .unwrap(),
        );

        let producers: Vec<_> = (0..3u64)
            .map(|p| {
                let queue = pool.queue().clone();
                tokio::spawn(async move {
                    for i in 0..10u64 {
                        queue.put(p * 10 + i).await.unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.await.unwrap();
        }
        pool.complete_adding();

        let pool = Arc::try_unwrap(pool).ok().expect("sole owner");
        let report = pool.join().await;
        let mut results = report.results;
        results.sort_unstable();
        assert_eq!(results, (0..30).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_failures_are_collected_not_fatal() {
        let pool = WorkerPool::collecting("picky", 2, 8, |x: i32| async move {
            if x < 0 {
                anyhow::bail!("negative input {}", x);
            }
            Ok(x)
        })
        .unwrap();

        for x in [1, -2, 3, -4, 5] {
            pool.put(x).await.unwrap();
        }
        pool.complete_adding();

        let report = pool.join().await;
        assert_eq!(report.results.len(), 3);
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures.iter().all(|f| f.stage == "picky"));
    }

    #[tokio::test]
    async fn test_zero_workers_rejected() {
        let result = WorkerPool::collecting("empty", 0, 1, |x: u8| async move {
            Ok::<_, anyhow::Error>(x)
        });
        assert!(matches!(result, Err(ConfigError::ZeroWorkers(name)) if name == "empty"));

        let result = WorkerPool::collecting("tiny", 1, 0, |x: u8| async move {
            Ok::<_, anyhow::Error>(x)
        });
        assert!(matches!(result, Err(ConfigError::ZeroCapacity(name)) if name == "tiny"));
    }

    struct CountDrains {
        drained: AtomicU64,
    }

    #[async_trait]
    impl Worker<u32> for CountDrains {
        async fn process(&self, _item: u32) -> Flow {
            tokio::task::yield_now().await;
            Flow::Continue
        }

        fn on_drained(&self) {
            self.drained.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_on_drained_called_exactly_once() {
        let queue = Arc::new(BoundedQueue::new(4).unwrap());
        let worker = Arc::new(CountDrains {
            drained: AtomicU64::new(0),
        });
        let pool = WorkerPool::spawn("drain", 5, queue.clone(), CancellationToken::new(), worker.clone())
            .unwrap();

        for i in 0..40 {
            queue.put(i).await.unwrap();
        }
        pool.complete_adding();
        let exit = pool.join().await;

        assert_eq!(exit.processed, 40);
        assert_eq!(worker.drained.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_stops_idle_workers() {
        let queue = Arc::new(BoundedQueue::<u32>::new(4).unwrap());
        let worker = Arc::new(CountDrains {
            drained: AtomicU64::new(0),
        });
        let pool = WorkerPool::spawn("idle", 3, queue, CancellationToken::new(), worker.clone())
            .unwrap();

        pool.cancel();
        let exit = tokio::time::timeout(Duration::from_secs(2), pool.join())
            .await
            .expect("cancelled workers should exit");

        assert_eq!(exit.processed, 0);
        assert_eq!(exit.cancelled_workers, 3);
        assert_eq!(worker.drained.load(Ordering::SeqCst), 1);
    }

    struct Panicky;

    #[async_trait]
    impl Worker<u32> for Panicky {
        async fn process(&self, item: u32) -> Flow {
            if item == 3 {
                panic!("worker bug");
            }
            Flow::Continue
        }
    }

    #[tokio::test]
    async fn test_panicking_worker_still_counts_as_exited() {
        let queue = Arc::new(BoundedQueue::new(8).unwrap());
        let pool = WorkerPool::spawn("panicky", 2, queue.clone(), CancellationToken::new(), Arc::new(Panicky))
            .unwrap();

        for i in 0..6 {
            queue.put(i).await.unwrap();
        }
        pool.complete_adding();

        let exit = tokio::time::timeout(Duration::from_secs(2), pool.join())
            .await
            .expect("pool should finish despite the panic");
        assert_eq!(exit.panicked_workers, 1);
    }

    #[tokio::test]
    async fn test_collecting_pool_survives_panicking_function() {
        let pool = WorkerPool::collecting("fragile", 1, 1, |x: u32| async move {
            if x == 0 {
                panic!("cannot handle zero");
            }
            Ok::<_, anyhow::Error>(x * 10)
        })
        .unwrap();

        let feed = async {
            for i in 0..5u32 {
                pool.put(i).await.unwrap();
            }
        };
        tokio::time::timeout(Duration::from_secs(3), feed)
            .await
            .expect("producer should not block behind a dead worker");
        pool.complete_adding();

        let report = tokio::time::timeout(Duration::from_secs(3), pool.join())
            .await
            .expect("pool should drain");

        assert_eq!(report.exit.panicked_workers, 0);
        assert_eq!(report.exit.processed, 5);
        let mut results = report.results;
        results.sort_unstable();
        assert_eq!(results, vec![10, 20, 30, 40]);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].error.to_string().contains("cannot handle zero"));
    }
}
