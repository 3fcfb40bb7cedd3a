//! Running a built pipeline: feeding, draining, cancelling and joining.
//!
//! ```text
//!  feed()/producer() ─▶ input ─▶ stage 1 ─▶ link ─▶ ... ─▶ stage k ─▶ output ─▶ output()
//!        │                │                                              │
//!  complete_adding() ─────┘ close              last worker exits ────────┘ close
//! ```
//!
//! Closing the input is the only way a pipeline finishes normally: every
//! stage drains its input and closes its output in turn. Cancellation closes
//! every queue top-down instead and stops workers at their next suspension
//! point.

use crate::error::{PipelineError, PutError};
use crate::pipeline::builder::PipelineBuilder;
use crate::pipeline::metrics::Metrics;
use crate::pipeline::stages::{LaunchStage, RunningStage, StageContext, StageReport};
use crate::queue::{BoundedQueue, Closeable, WorkItem};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lazy, finite, non-restartable sequence of final outputs.
pub type OutputStream<Out> = BoxStream<'static, WorkItem<Out>>;

/// A wired pipeline that has not started yet.
pub struct Pipeline<In, Out> {
    pub(crate) input: Arc<BoundedQueue<WorkItem<In>>>,
    pub(crate) output: Arc<BoundedQueue<WorkItem<Out>>>,
    pub(crate) output_external: bool,
    pub(crate) stages: Vec<Box<dyn LaunchStage>>,
    /// Every queue, input first.
    pub(crate) links: Vec<Arc<dyn Closeable>>,
    pub(crate) ctx: StageContext,
}

impl<In: Send + 'static> Pipeline<In, In> {
    pub fn builder() -> PipelineBuilder<In, In> {
        PipelineBuilder::new()
    }
}

impl<In, Out> Pipeline<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// The queue feeding the first stage.
    pub fn input(&self) -> &Arc<BoundedQueue<WorkItem<In>>> {
        &self.input
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.ctx.cancel.clone()
    }

    /// Start every stage's workers.
    pub fn start(self) -> Result<RunningPipeline<In, Out>, PipelineError> {
        let Pipeline {
            input,
            output,
            output_external,
            stages,
            links,
            ctx,
        } = self;

        ctx.metrics.reset();

        let mut running = Vec::with_capacity(stages.len());
        for stage in stages {
            match stage.launch(&ctx) {
                Ok(stage) => running.push(stage),
                Err(e) => {
                    ctx.cancel.cancel();
                    links.iter().for_each(|link| link.close());
                    return Err(e.into());
                }
            }
        }

        let done = CancellationToken::new();
        let watcher = tokio::spawn(close_on_cancel(ctx.cancel.clone(), done.clone(), links));

        tracing::info!("Pipeline started with {} stages", running.len());

        Ok(RunningPipeline {
            input,
            output,
            output_taken: output_external,
            stages: running,
            feeders: Vec::new(),
            closer: None,
            feed: Arc::new(FeedState::default()),
            ctx,
            done,
            watcher,
            started: Instant::now(),
        })
    }

    /// Feed `items`, close the input, and collect every output.
    pub async fn run<I>(self, items: I) -> Result<RunOutcome<Out>, PipelineError>
    where
        I: IntoIterator<Item = In>,
        I::IntoIter: Send + 'static,
    {
        let mut running = self.start()?;
        running.feed(stream::iter(items));
        running.complete_adding();

        let outputs = match running.output() {
            Some(output) => output.map(|item| item.payload).collect().await,
            None => Vec::new(),
        };
        let summary = running.join().await?;

        Ok(RunOutcome { outputs, summary })
    }
}

async fn close_on_cancel(cancel: CancellationToken, done: CancellationToken, links: Vec<Arc<dyn Closeable>>) {
    tokio::select! {
        _ = cancel.cancelled() => {
            tracing::info!("Pipeline cancelled, closing {} queues", links.len());
            for link in &links {
                link.close();
            }
        }
        _ = done.cancelled() => {}
    }
}

#[derive(Debug, Default)]
struct FeedState {
    next_seq: AtomicU64,
    accepted: AtomicU64,
}

/// Handle for putting items into a running pipeline's input.
///
/// Sequence numbers are assigned when a put is attempted; a put rejected
/// because the input closed leaves a gap.
pub struct Producer<In> {
    queue: Arc<BoundedQueue<WorkItem<In>>>,
    feed: Arc<FeedState>,
    metrics: Arc<Metrics>,
}

impl<In> Clone for Producer<In> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            feed: self.feed.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<In: Send> Producer<In> {
    /// Put one item, suspending while the input is full. Returns its `seq`.
    pub async fn put(&self, payload: In) -> Result<u64, PutError<In>> {
        let seq = self.feed.next_seq.fetch_add(1, Ordering::Relaxed);
        let put = self.queue.put(WorkItem::with_seq(seq, payload)).await;
        self.accept(seq, put)
    }

    /// Like [`Producer::put`], giving up after `timeout`.
    pub async fn put_timeout(&self, payload: In, timeout: Duration) -> Result<u64, PutError<In>> {
        let seq = self.feed.next_seq.fetch_add(1, Ordering::Relaxed);
        let put = self.queue.put_timeout(WorkItem::with_seq(seq, payload), timeout).await;
        self.accept(seq, put)
    }

    fn accept(&self, seq: u64, put: Result<(), PutError<WorkItem<In>>>) -> Result<u64, PutError<In>> {
        match put {
            Ok(()) => {
                self.feed.accepted.fetch_add(1, Ordering::Relaxed);
                self.metrics.add_item_fed();
                Ok(seq)
            }
            Err(e) => Err(PutError {
                kind: e.kind,
                item: e.item.payload,
            }),
        }
    }

    /// Whether the input no longer accepts items.
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

/// Coarse lifecycle of a running pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Input still open.
    Running,
    /// Input closed, stages still draining.
    Draining,
    /// Output closed and empty.
    Finished,
    Cancelled,
}

/// A started pipeline.
pub struct RunningPipeline<In, Out> {
    input: Arc<BoundedQueue<WorkItem<In>>>,
    output: Arc<BoundedQueue<WorkItem<Out>>>,
    /// Set once `output()` handed out the stream, or from the start when the
    /// caller owns the output queue.
    output_taken: bool,
    stages: Vec<RunningStage>,
    feeders: Vec<JoinHandle<()>>,
    closer: Option<JoinHandle<()>>,
    feed: Arc<FeedState>,
    ctx: StageContext,
    done: CancellationToken,
    watcher: JoinHandle<()>,
    started: Instant,
}

impl<In, Out> RunningPipeline<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// A cloneable handle for direct puts.
    pub fn producer(&self) -> Producer<In> {
        Producer {
            queue: self.input.clone(),
            feed: self.feed.clone(),
            metrics: self.ctx.metrics.clone(),
        }
    }

    /// Spawn a producer draining `items` into the input. May be called
    /// several times; [`RunningPipeline::complete_adding`] waits for all of
    /// them before closing the input.
    pub fn feed<S>(&mut self, items: S)
    where
        S: Stream<Item = In> + Send + 'static,
    {
        let producer = self.producer();
        let cancel = self.ctx.cancel.clone();
        self.feeders.push(tokio::spawn(async move {
            let mut items = Box::pin(items);
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tracing::debug!("Pipeline cancelled, feeder stopping");
                        break;
                    }
                    next = items.next() => next,
                };
                let Some(item) = next else {
                    break;
                };
                if producer.put(item).await.is_err() {
                    tracing::debug!("Input closed, feeder stopping");
                    break;
                }
            }
        }));
    }

    /// Close the input once every feeder spawned so far has finished.
    ///
    /// Items put through a [`Producer`] after the input closes are rejected.
    /// After a cancel the input is closed without waiting for feeders.
    pub fn complete_adding(&mut self) {
        let feeders = std::mem::take(&mut self.feeders);
        let previous = self.closer.take();
        let input = self.input.clone();
        let cancel = self.ctx.cancel.clone();

        self.closer = Some(tokio::spawn(async move {
            let pending = async {
                if let Some(previous) = previous {
                    let _ = previous.await;
                }
                for feeder in feeders {
                    if let Err(e) = feeder.await {
                        tracing::error!("Feeder task failed: {}", e);
                    }
                }
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => tracing::debug!("Cancelled, closing input without waiting for feeders"),
                _ = pending => {}
            }
            input.close();
            tracing::info!("Input closed");
        }));
    }

    /// The final outputs, available once. `None` if already taken or the
    /// output queue belongs to the caller.
    ///
    /// Consume the stream before or concurrently with [`RunningPipeline::join`].
    pub fn output(&mut self) -> Option<OutputStream<Out>> {
        if self.output_taken {
            return None;
        }
        self.output_taken = true;
        Some(drain_stream(self.output.clone()))
    }

    pub fn cancel(&self) {
        self.ctx.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.ctx.cancel.clone()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.ctx.metrics
    }

    /// Once the last stage has drained, a later cancel on a shared token
    /// no longer changes the state.
    pub fn state(&self) -> PipelineState {
        let drained = self.stages.last().is_some_and(|stage| stage.drained());
        if drained && self.output.is_finished() {
            PipelineState::Finished
        } else if drained {
            PipelineState::Draining
        } else if self.ctx.cancel.is_cancelled() {
            PipelineState::Cancelled
        } else if self.input.is_closed() {
            PipelineState::Draining
        } else {
            PipelineState::Running
        }
    }

    /// Wait until every stage has exited.
    ///
    /// Closes the input after pending feeders if that has not happened yet,
    /// and discards outputs nobody took.
    pub async fn join(mut self) -> Result<RunSummary, PipelineError> {
        if self.closer.is_none() || !self.feeders.is_empty() {
            self.complete_adding();
        }

        let discard = self.output().map(|output| tokio::spawn(output.count()));

        if let Some(closer) = self.closer.take() {
            closer.await.map_err(|e| PipelineError::Join {
                stage: "input".to_string(),
                message: e.to_string(),
            })?;
        }

        let mut stages = Vec::with_capacity(self.stages.len());
        for stage in self.stages {
            stages.push(stage.join().await);
        }

        if let Some(discard) = discard {
            let discarded = discard.await.map_err(|e| PipelineError::Join {
                stage: "output".to_string(),
                message: e.to_string(),
            })?;
            if discarded > 0 {
                tracing::debug!("Discarded {} outputs nobody took", discarded);
            }
        }

        self.done.cancel();
        let _ = self.watcher.await;

        let status = if stages.last().is_some_and(|stage| stage.drained) {
            RunStatus::Completed
        } else {
            RunStatus::Cancelled
        };

        let summary = RunSummary {
            status,
            items_fed: self.feed.accepted.load(Ordering::Relaxed),
            items_out: stages.last().map_or(0, |s| s.emitted),
            failures: stages.iter().map(|s| s.failed).sum(),
            elapsed: self.started.elapsed(),
            stages,
        };

        tracing::info!("Pipeline {}", summary);
        Ok(summary)
    }
}

fn drain_stream<T: Send + 'static>(queue: Arc<BoundedQueue<T>>) -> BoxStream<'static, T> {
    stream::unfold(queue, |queue| async move {
        let item = queue.take().await?;
        Some((item, queue))
    })
    .boxed()
}

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Every fed item went through every stage (some may have failed).
    Completed,
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of a run that was not a fatal error.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub status: RunStatus,
    pub items_fed: u64,
    pub items_out: u64,
    /// Transform failures across all stages.
    pub failures: u64,
    pub elapsed: Duration,
    pub stages: Vec<StageReport>,
}

impl RunSummary {
    pub fn is_cancelled(&self) -> bool {
        self.status == RunStatus::Cancelled
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} in {:.2}s: {} in, {} out, {} failures",
            self.status,
            self.elapsed.as_secs_f64(),
            self.items_fed,
            self.items_out,
            self.failures
        )?;
        for stage in &self.stages {
            write!(f, " | {}: {}→{}", stage.name, stage.taken, stage.emitted)?;
            if stage.failed > 0 {
                write!(f, " ({} failed)", stage.failed)?;
            }
        }
        Ok(())
    }
}

/// Outputs and summary of [`Pipeline::run`].
#[derive(Debug)]
pub struct RunOutcome<Out> {
    /// Final outputs in arrival order.
    pub outputs: Vec<Out>,
    pub summary: RunSummary,
}
