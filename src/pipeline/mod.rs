//! Stages, worker pools, pipeline composition and fork-join aggregation.

mod builder;
mod failure;
mod fork_join;
mod metrics;
mod runner;
mod stages;
mod worker_pool;


pub use builder::{PipelineBuilder, DEFAULT_INPUT_CAPACITY};
pub use failure::{FailureLog, FailureSink, LogOnly, ResultCollector};
pub use fork_join::{chunk_ranges, Chunk, ChunkPolicy, ForkJoin};
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot, StageMetrics, StageSnapshot};
pub use runner::{
    OutputStream, Pipeline, PipelineState, Producer, RunOutcome, RunStatus, RunSummary, RunningPipeline,
};
pub use stages::{RunningStage, Stage, StageContext, StageReport};
pub use worker_pool::{CollectingPool, ExitReason, Flow, PoolExit, PoolReport, Worker, WorkerExit, WorkerPool};
