//! Fork-join aggregation over contiguous chunks of a collection.
//!
//! ```text
//!   [0 .. len)  ──split──▶  chunk 0 │ chunk 1 │ ... │ chunk M-1
//!                              │        │               │      (concurrent)
//!                              ▼        ▼               ▼
//!                           slot 0   slot 1   ...    slot M-1
//!                              └────────┴──combine──────┘      (index order)
//! ```
//!
//! Chunk `i` covers `i*size .. min(len, (i+1)*size)` with
//! `size = ceil(len / min(M, len))`. Empty chunks are never built, so fewer
//! than M units may run for short collections.
//!
//! Each chunk task reports `(index, result)` into a [`BoundedQueue`] sized to
//! the chunk count; the caller takes exactly one report per chunk, so a
//! failing chunk never shortcuts the wait for the others.

use crate::error::{panic_message, AggregateFailure, ChunkFailure, ConfigError};
use crate::queue::BoundedQueue;
use anyhow::Result;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::ops::Range;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// How many chunks a job is split into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChunkPolicy {
    /// Exactly this many chunks (fewer if the collection is shorter).
    Fixed(usize),
    /// One chunk per core the process may use.
    #[default]
    AvailableWorkers,
}

impl ChunkPolicy {
    pub fn chunk_count(&self) -> Result<usize, ConfigError> {
        match *self {
            ChunkPolicy::Fixed(0) => Err(ConfigError::ZeroChunks),
            ChunkPolicy::Fixed(n) => Ok(n),
            ChunkPolicy::AvailableWorkers => Ok(std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)),
        }
    }
}

/// Non-empty chunk ranges covering `0..len`.
pub fn chunk_ranges(len: usize, chunks: usize) -> Vec<Range<usize>> {
    if len == 0 || chunks == 0 {
        return Vec::new();
    }
    // More chunks than items would only add empty ones.
    let size = len.div_ceil(chunks.min(len));
    (0..len)
        .step_by(size)
        .map(|start| start..start + size.min(len - start))
        .collect()
}

/// One slice of the input handed to a chunk function.
#[derive(Debug)]
pub struct Chunk<T> {
    pub index: usize,
    /// Position of `items` within the original collection.
    pub range: Range<usize>,
    pub items: Vec<T>,
}

fn split<T>(mut items: Vec<T>, chunks: usize) -> Vec<Chunk<T>> {
    let ranges = chunk_ranges(items.len(), chunks);
    let mut out = Vec::with_capacity(ranges.len());

    // Split from the back so each split_off is O(chunk).
    for (index, range) in ranges.into_iter().enumerate().rev() {
        let tail = items.split_off(range.start);
        out.push(Chunk { index, range, items: tail });
    }
    out.reverse();
    out
}

/// Runs chunked jobs.
#[derive(Debug, Clone, Copy)]
pub struct ForkJoin {
    chunks: usize,
}

/// A finished chunk: its index and what `chunk_fn` returned.
type Report<R> = (usize, Result<R>);

impl ForkJoin {
    pub fn new(policy: ChunkPolicy) -> Result<Self, ConfigError> {
        Ok(Self {
            chunks: policy.chunk_count()?,
        })
    }

    /// Requested chunk count.
    pub fn chunks(&self) -> usize {
        self.chunks
    }

    /// Run `chunk_fn` on every chunk concurrently, then `combine` once over
    /// the partial results in chunk-index order.
    ///
    /// If any chunk fails (error or panic), every other chunk is still awaited
    /// and all failures are returned together; `combine` does not run.
    pub async fn run<T, R, C, F, Fut, G>(
        &self,
        items: Vec<T>,
        chunk_fn: F,
        combine: G,
    ) -> Result<C, AggregateFailure>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(Chunk<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        G: FnOnce(Vec<R>) -> C,
    {
        let chunks = split(items, self.chunks);
        let ranges: Vec<Range<usize>> = chunks.iter().map(|c| c.range.clone()).collect();
        let reports = Arc::new(BoundedQueue::with_min_capacity(chunks.len()));
        let chunk_fn = Arc::new(chunk_fn);

        for chunk in chunks {
            let chunk_fn = chunk_fn.clone();
            let reports = reports.clone();
            tokio::spawn(async move {
                let index = chunk.index;
                let outcome = AssertUnwindSafe(async move { chunk_fn(chunk).await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(panicked(panic)));
                report(&reports, index, outcome);
            });
        }

        gather(&reports, ranges, combine).await
    }

    /// Like [`ForkJoin::run`], for CPU-bound chunk functions. Each chunk runs
    /// on the blocking thread pool.
    pub async fn run_blocking<T, R, C, F, G>(
        &self,
        items: Vec<T>,
        chunk_fn: F,
        combine: G,
    ) -> Result<C, AggregateFailure>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(Chunk<T>) -> Result<R> + Send + Sync + 'static,
        G: FnOnce(Vec<R>) -> C,
    {
        let chunks = split(items, self.chunks);
        let ranges: Vec<Range<usize>> = chunks.iter().map(|c| c.range.clone()).collect();
        let reports = Arc::new(BoundedQueue::with_min_capacity(chunks.len()));
        let chunk_fn = Arc::new(chunk_fn);

        for chunk in chunks {
            let chunk_fn = chunk_fn.clone();
            let reports = reports.clone();
            tokio::task::spawn_blocking(move || {
                let index = chunk.index;
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| chunk_fn(chunk)))
                    .unwrap_or_else(|panic| Err(panicked(panic)));
                report(&reports, index, outcome);
            });
        }

        gather(&reports, ranges, combine).await
    }
}

fn panicked(payload: Box<dyn Any + Send>) -> anyhow::Error {
    anyhow::anyhow!("chunk panicked: {}", panic_message(payload.as_ref()))
}

// The report queue holds one slot per chunk, so this never has to wait.
fn report<R>(reports: &BoundedQueue<Report<R>>, index: usize, outcome: Result<R>) {
    if reports.try_put((index, outcome)).is_err() {
        tracing::error!("Chunk {} finished after its job was abandoned", index);
    }
}

/// Take exactly one report per chunk, then combine in index order.
async fn gather<R, C, G>(
    reports: &BoundedQueue<Report<R>>,
    ranges: Vec<Range<usize>>,
    combine: G,
) -> Result<C, AggregateFailure>
where
    G: FnOnce(Vec<R>) -> C,
{
    let total_chunks = ranges.len();
    let mut slots: Vec<Option<R>> = (0..total_chunks).map(|_| None).collect();
    let mut failures = Vec::new();

    for _ in 0..total_chunks {
        let Some((index, outcome)) = reports.take().await else {
            break;
        };
        match outcome {
            Ok(partial) => slots[index] = Some(partial),
            Err(error) => {
                let range = ranges[index].clone();
                tracing::warn!("Chunk {} ({}..{}) failed: {:#}", index, range.start, range.end, error);
                failures.push(ChunkFailure { index, range, error });
            }
        }
    }
    reports.close();

    if !failures.is_empty() {
        failures.sort_by_key(|f| f.index);
        return Err(AggregateFailure {
            failures,
            total_chunks,
        });
    }

    let partials = slots.into_iter().flatten().collect();
    Ok(combine(partials))
}
