//! Error types for queues, stages, pipelines and fork-join jobs.

use std::any::Any;
use std::fmt;
use std::ops::Range;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single queue operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// `put` was called on a closed queue.
    #[error("queue is closed")]
    Closed,

    /// The deadline passed before the operation could complete.
    #[error("queue operation timed out after {0:?}")]
    Timeout(Duration),
}

/// A rejected `put`, handing the item back to the caller.
#[derive(Error)]
#[error("put rejected: {kind}")]
pub struct PutError<T> {
    pub kind: QueueError,
    pub item: T,
}

impl<T> PutError<T> {
    pub(crate) fn closed(item: T) -> Self {
        Self {
            kind: QueueError::Closed,
            item,
        }
    }

    pub(crate) fn timeout(item: T, after: Duration) -> Self {
        Self {
            kind: QueueError::Timeout(after),
            item,
        }
    }

    /// Whether the queue was closed when the put was attempted.
    pub fn is_closed(&self) -> bool {
        self.kind == QueueError::Closed
    }

    /// Recover the item that was not enqueued.
    pub fn into_inner(self) -> T {
        self.item
    }
}

impl<T> fmt::Debug for PutError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PutError").field("kind", &self.kind).finish_non_exhaustive()
    }
}

/// A user transform failed for one item.
///
/// These never abort a stage; they are routed to the pipeline's failure sink.
#[derive(Debug, Error)]
#[error("stage '{stage}' failed on item {}: {error:#}", display_seq(.seq))]
pub struct TransformFailure {
    /// Name of the stage (or pool) whose transform failed.
    pub stage: String,
    /// Sequence number of the input item, when the producer assigned one.
    pub seq: Option<u64>,
    /// The error reported by the transform.
    pub error: anyhow::Error,
}

fn display_seq(seq: &Option<u64>) -> String {
    match seq {
        Some(seq) => format!("#{seq}"),
        None => "<unsequenced>".to_string(),
    }
}

/// One failed fork-join chunk.
#[derive(Debug, Error)]
#[error("chunk {index} ({}..{}) failed: {error:#}", .range.start, .range.end)]
pub struct ChunkFailure {
    pub index: usize,
    pub range: Range<usize>,
    pub error: anyhow::Error,
}

/// Every chunk failure of a fork-join job, reported once all chunks finished.
#[derive(Debug, Error)]
#[error("{} of {total_chunks} chunks failed: {}", .failures.len(), summarize(.failures))]
pub struct AggregateFailure {
    /// Failures sorted by chunk index.
    pub failures: Vec<ChunkFailure>,
    pub total_chunks: usize,
}

impl AggregateFailure {
    /// Indices of the chunks that failed, in ascending order.
    pub fn failed_indices(&self) -> Vec<usize> {
        self.failures.iter().map(|f| f.index).collect()
    }
}

fn summarize(failures: &[ChunkFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("[{}] {:#}", f.index, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Structural misconfiguration, detected before any work flows.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("'{0}' must have at least one worker")]
    ZeroWorkers(String),

    #[error("capacity of {0} must be at least 1")]
    ZeroCapacity(String),

    #[error("fork-join chunk count must be at least 1")]
    ZeroChunks,

    #[error("{0} queue is already closed")]
    QueueAlreadyClosed(String),

    #[error("invalid wiring: {0}")]
    Wiring(String),
}

/// Fatal pipeline outcome.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("stage '{stage}' supervisor failed: {message}")]
    Join { stage: String, message: String },
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_error_returns_item() {
        let err = PutError::closed(42);
        assert!(err.is_closed());
        assert_eq!(err.to_string(), "put rejected: queue is closed");
        assert_eq!(err.into_inner(), 42);
    }

    #[test]
    fn test_put_error_timeout_kind() {
        let err = PutError::timeout("x", Duration::from_millis(5));
        assert!(!err.is_closed());
        assert_eq!(err.kind, QueueError::Timeout(Duration::from_millis(5)));
    }

    #[test]
    fn test_transform_failure_display() {
        let failure = TransformFailure {
            stage: "square".to_string(),
            seq: Some(6),
            error: anyhow::anyhow!("bad value 7"),
        };
        let display = failure.to_string();
        assert!(display.contains("square"));
        assert!(display.contains("#6"));
        assert!(display.contains("bad value 7"));

        let unsequenced = TransformFailure {
            stage: "pool".to_string(),
            seq: None,
            error: anyhow::anyhow!("boom"),
        };
        assert!(unsequenced.to_string().contains("<unsequenced>"));
    }

    #[test]
    fn test_aggregate_failure_display() {
        let failure = AggregateFailure {
            failures: vec![
                ChunkFailure {
                    index: 1,
                    range: 25..50,
                    error: anyhow::anyhow!("first"),
                },
                ChunkFailure {
                    index: 3,
                    range: 75..100,
                    error: anyhow::anyhow!("second"),
                },
            ],
            total_chunks: 4,
        };

        let display = failure.to_string();
        assert!(display.starts_with("2 of 4 chunks failed"));
        assert!(display.contains("[1] first"));
        assert!(display.contains("[3] second"));
        assert_eq!(failure.failed_indices(), vec![1, 3]);
    }
}
