//! A single pipeline stage: one transform run by N workers.
//!
//! ```text
//!   input queue ──▶ ┌ worker 1 ┐
//!                   │ worker 2 │ ── transform ──▶ output queue
//!                   └ worker N ┘
//! ```
//!
//! Workers share the input queue. Each result of a transform is put
//! downstream individually, in the order the transform produced it, so a
//! full output queue suspends the worker (backpressure). A failing transform
//! only loses its own item: the failure goes to the [`FailureSink`] and the
//! worker moves on. When the last worker exits the stage closes its output,
//! which is what lets completion cascade to the next stage.

use crate::config::CancelPolicy;
use crate::error::{panic_message, ConfigError, TransformFailure};
use crate::pipeline::failure::FailureSink;
use crate::pipeline::metrics::{Metrics, StageMetrics};
use crate::pipeline::worker_pool::{Flow, PoolExit, Worker, WorkerPool};
use crate::queue::{BoundedQueue, WorkItem};
use crate::transform::Transform;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Run-wide collaborators shared by every stage.
#[derive(Clone)]
pub struct StageContext {
    pub cancel: CancellationToken,
    pub policy: CancelPolicy,
    pub sink: Arc<dyn FailureSink>,
    pub metrics: Arc<Metrics>,
}

/// A configured stage, not yet running.
pub struct Stage<In, Out, X> {
    name: String,
    workers: usize,
    input: Arc<BoundedQueue<WorkItem<In>>>,
    output: Arc<BoundedQueue<WorkItem<Out>>>,
    transform: Arc<X>,
}

impl<In, Out, X> Stage<In, Out, X>
where
    In: Send + 'static,
    Out: Send + 'static,
    X: Transform<In, Out>,
{
    /// Wire a transform between two queues.
    pub fn new(
        name: impl Into<String>,
        workers: usize,
        input: Arc<BoundedQueue<WorkItem<In>>>,
        output: Arc<BoundedQueue<WorkItem<Out>>>,
        transform: X,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        if workers == 0 {
            return Err(ConfigError::ZeroWorkers(name));
        }
        if input.is_closed() {
            return Err(ConfigError::QueueAlreadyClosed(format!("input of stage '{}'", name)));
        }
        if output.is_closed() {
            return Err(ConfigError::QueueAlreadyClosed(format!("output of stage '{}'", name)));
        }

        Ok(Self {
            name,
            workers,
            input,
            output,
            transform: Arc::new(transform),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn input(&self) -> &Arc<BoundedQueue<WorkItem<In>>> {
        &self.input
    }

    pub fn output(&self) -> &Arc<BoundedQueue<WorkItem<Out>>> {
        &self.output
    }

    /// Start the workers.
    pub fn spawn(self, ctx: &StageContext) -> Result<RunningStage, ConfigError> {
        let metrics = ctx.metrics.register_stage(&self.name, self.workers);
        let worker = Arc::new(StageWorker {
            name: self.name.clone(),
            transform: self.transform,
            output: self.output,
            ctx: ctx.clone(),
            metrics: metrics.clone(),
            _types: PhantomData,
        });

        let pool = WorkerPool::spawn(
            self.name.clone(),
            self.workers,
            self.input,
            ctx.cancel.clone(),
            worker,
        )?;

        tracing::info!("Stage '{}' started with {} workers", self.name, self.workers);

        Ok(RunningStage {
            name: self.name,
            workers: self.workers,
            metrics,
            exit: pool.join().boxed(),
        })
    }
}

/// Type-erased [`Stage`], so a pipeline can hold stages of differing types.
pub(crate) trait LaunchStage: Send {
    fn name(&self) -> &str;
    fn launch(self: Box<Self>, ctx: &StageContext) -> Result<RunningStage, ConfigError>;
}

impl<In, Out, X> LaunchStage for Stage<In, Out, X>
where
    In: Send + 'static,
    Out: Send + 'static,
    X: Transform<In, Out>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn launch(self: Box<Self>, ctx: &StageContext) -> Result<RunningStage, ConfigError> {
        (*self).spawn(ctx)
    }
}

/// A stage whose workers are running.
pub struct RunningStage {
    name: String,
    workers: usize,
    metrics: Arc<StageMetrics>,
    exit: BoxFuture<'static, PoolExit>,
}

impl RunningStage {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Whether every worker has exited after draining the input, before any
    /// cancellation.
    pub fn drained(&self) -> bool {
        self.metrics.is_drained()
    }

    /// Wait for every worker of the stage to exit.
    pub async fn join(self) -> StageReport {
        let exit = self.exit.await;
        let counters = self.metrics.snapshot();

        if exit.panicked_workers > 0 {
            tracing::error!(
                "Stage '{}': {} of {} workers panicked",
                self.name,
                exit.panicked_workers,
                exit.workers
            );
        }

        StageReport {
            name: self.name,
            workers: self.workers,
            taken: counters.taken,
            emitted: counters.emitted,
            failed: counters.failed,
            cancelled_workers: exit.cancelled_workers,
            panicked_workers: exit.panicked_workers,
            drained: self.metrics.is_drained(),
        }
    }
}

/// What one stage did during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub name: String,
    pub workers: usize,
    pub taken: u64,
    pub emitted: u64,
    pub failed: u64,
    pub cancelled_workers: usize,
    pub panicked_workers: usize,
    /// The stage finished its input before any cancellation.
    pub drained: bool,
}

struct StageWorker<In, Out, X> {
    name: String,
    transform: Arc<X>,
    output: Arc<BoundedQueue<WorkItem<Out>>>,
    ctx: StageContext,
    metrics: Arc<StageMetrics>,
    _types: PhantomData<fn(In) -> Out>,
}

impl<In, Out, X> StageWorker<In, Out, X> {
    fn fail(&self, seq: Option<u64>, error: anyhow::Error) {
        self.metrics.add_failed();
        self.ctx.metrics.add_failure();
        self.ctx.sink.record(TransformFailure {
            stage: self.name.clone(),
            seq,
            error,
        });
    }
}

#[async_trait]
impl<In, Out, X> Worker<WorkItem<In>> for StageWorker<In, Out, X>
where
    In: Send + 'static,
    Out: Send + 'static,
    X: Transform<In, Out>,
{
    async fn process(&self, item: WorkItem<In>) -> Flow {
        self.metrics.add_taken();
        let seq = item.seq;

        let started = Instant::now();
        let applied = AssertUnwindSafe(self.transform.apply(item.payload)).catch_unwind();
        let outcome = match self.ctx.policy {
            CancelPolicy::Abandon => tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => {
                    tracing::debug!("Stage '{}' abandoned item {:?}", self.name, seq);
                    return Flow::Stop;
                }
                outcome = applied => outcome,
            },
            CancelPolicy::FinishInFlight => applied.await,
        };
        self.metrics.add_busy_time(started.elapsed());

        let emitted = match outcome {
            Ok(Ok(emitted)) => emitted,
            Ok(Err(error)) => {
                self.fail(seq, error);
                return Flow::Continue;
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                self.fail(seq, anyhow::anyhow!("transform panicked: {}", message));
                return Flow::Continue;
            }
        };

        for payload in emitted {
            let put = tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => return Flow::Stop,
                put = self.output.put(WorkItem { seq, payload }) => put,
            };

            if put.is_err() {
                tracing::debug!("Stage '{}' output closed, worker stopping", self.name);
                return Flow::Stop;
            }
            self.metrics.add_emitted();
        }

        Flow::Continue
    }

    fn on_drained(&self) {
        if !self.ctx.cancel.is_cancelled() {
            self.metrics.mark_drained();
        }
        self.output.close();
        tracing::info!("Stage '{}' drained, output closed", self.name);
    }
}
