//! Sinks for per-item failures and collectors for unordered results.

use crate::error::TransformFailure;
use std::sync::{Mutex, MutexGuard};

/// Receives every per-item transform failure of a pipeline or pool.
///
/// Injected at construction; called concurrently from worker tasks.
pub trait FailureSink: Send + Sync {
    fn record(&self, failure: TransformFailure);
}

/// Logs failures and discards them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnly;

impl FailureSink for LogOnly {
    fn record(&self, failure: TransformFailure) {
        tracing::warn!("{}", failure);
    }
}

/// Logs failures and keeps them for inspection after the run.
#[derive(Debug, Default)]
pub struct FailureLog {
    failures: Mutex<Vec<TransformFailure>>,
}

impl FailureLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TransformFailure>> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Sequence numbers of the failed items, sorted.
    pub fn failed_seqs(&self) -> Vec<u64> {
        let mut seqs: Vec<u64> = self.lock().iter().filter_map(|f| f.seq).collect();
        seqs.sort_unstable();
        seqs
    }

    /// Take every recorded failure, leaving the log empty.
    pub fn drain(&self) -> Vec<TransformFailure> {
        std::mem::take(&mut *self.lock())
    }
}

impl FailureSink for FailureLog {
    fn record(&self, failure: TransformFailure) {
        tracing::warn!("{}", failure);
        self.lock().push(failure);
    }
}

/// Thread-safe bag of results, in completion order.
#[derive(Debug)]
pub struct ResultCollector<R> {
    results: Mutex<Vec<R>>,
}

impl<R> Default for ResultCollector<R> {
    fn default() -> Self {
        Self {
            results: Mutex::new(Vec::new()),
        }
    }
}

impl<R> ResultCollector<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, result: R) {
        self.results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(result);
    }

    pub fn len(&self) -> usize {
        self.results.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the collected results, leaving the collector empty.
    pub fn drain(&self) -> Vec<R> {
        std::mem::take(&mut *self.results.lock().unwrap_or_else(|e| e.into_inner()))
    }
}
