//! stagepipe
//!
//! A bounded multi-stage pipeline engine: work items move through an ordered
//! list of stages, each stage running its own pool of async workers, with
//! backpressure from bounded queues between stages and completion cascading
//! from the first stage to the last.
//!
//! # Architecture
//!
//! - **Queue**: [`BoundedQueue`] with suspending put/take and one-shot close
//! - **Transform**: per-item `In -> none | one | many Out` capabilities
//! - **Pipeline**: stages, worker pools, cancellation, metrics and
//!   fork-join aggregation
//!
//! # Usage
//!
//! ```no_run
//! use stagepipe::{map, Pipeline, StageConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pipeline = Pipeline::builder()
//!         .stage(
//!             StageConfig::new("double", 4),
//!             map(|x: u64| async move { Ok::<_, anyhow::Error>(x * 2) }),
//!         )
//!         .build()?;
//!
//!     let outcome = pipeline.run(1..=100u64).await?;
//!     println!("{}", outcome.summary);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod transform;

pub use config::{CancelPolicy, Config, StageConfig};
pub use error::{AggregateFailure, ChunkFailure, ConfigError, PipelineError, PutError, QueueError, TransformFailure};
pub use pipeline::{
    ChunkPolicy, FailureLog, FailureSink, ForkJoin, Metrics, MetricsReporter, Pipeline, PipelineBuilder,
    RunOutcome, RunStatus, RunSummary, RunningPipeline, WorkerPool,
};
pub use queue::{BoundedQueue, WorkItem};
pub use transform::{expand, filter, map, try_map, DemoTransform, Emit, Transform};

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Result of the demo run: the pipeline summary and the fork-join total.
#[derive(Debug)]
pub struct DemoReport {
    pub summary: RunSummary,
    pub total: i64,
}

/// Run the numeric demo pipeline described by `config` over `1..=items`,
/// then sum its outputs with fork-join.
pub async fn run_pipeline(config: Config, items: u64) -> Result<DemoReport> {
    config.validate()?;
    let last = i64::try_from(items).with_context(|| format!("Item count {} exceeds i64::MAX", items))?;

    tracing::info!("Starting stagepipe with {} stages", config.pipeline.stages.len());

    let metrics = Metrics::new();
    let failures = Arc::new(FailureLog::new());

    let mut builder = Pipeline::builder()
        .input_capacity(config.pipeline.input_capacity)
        .cancel_policy(config.pipeline.cancel_policy)
        .failure_sink(failures.clone())
        .metrics(metrics.clone());

    for stage in &config.pipeline.stages {
        let transform: DemoTransform = stage
            .transform
            .parse()
            .with_context(|| format!("Stage '{}'", stage.name))?;
        tracing::info!(
            "Stage '{}': {} x{} (capacity {})",
            stage.name,
            transform,
            stage.workers,
            stage.capacity
        );
        builder = builder.stage(stage.clone(), transform);
    }

    let pipeline = builder.build()?;

    // Start metrics reporter
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let reporter_handle = if config.runtime.enable_metrics {
        let reporter = MetricsReporter::new(metrics.clone(), config.runtime.metrics_interval_secs, items);
        Some(tokio::spawn(reporter.run(shutdown_rx)))
    } else {
        None
    };

    let outcome = pipeline.run(1..=last).await?;

    // Stop metrics reporter
    let _ = shutdown_tx.send(()).await;
    if let Some(handle) = reporter_handle {
        let _ = handle.await;
    }

    if !failures.is_empty() {
        tracing::warn!("{} items failed: seq {:?}", failures.len(), failures.failed_seqs());
    }

    let fork_join = ForkJoin::new(config.fork_join.chunk_policy())?;
    tracing::info!("Summing {} outputs in {} chunks", outcome.outputs.len(), fork_join.chunks());

    let total = fork_join
        .run_blocking(
            outcome.outputs,
            |chunk| {
                chunk
                    .items
                    .iter()
                    .try_fold(0i64, |acc, &x| acc.checked_add(x))
                    .ok_or_else(|| anyhow::anyhow!("Sum of chunk {} overflows", chunk.index))
            },
            |partials| partials.into_iter().try_fold(0i64, |acc, x| acc.checked_add(x)),
        )
        .await?
        .context("Total overflows")?;

    if config.runtime.enable_metrics {
        MetricsReporter::new(metrics.clone(), config.runtime.metrics_interval_secs, items).print_summary();
    }

    if let Some(path) = &config.runtime.metrics_output_path {
        metrics.snapshot().save_to_file(path)?;
    }

    tracing::info!("Pipeline {}", outcome.summary);
    tracing::info!("Fork-join total: {}", total);

    Ok(DemoReport {
        summary: outcome.summary,
        total,
    })
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
