//! Typed construction of a [`Pipeline`].
//!
//! The builder tracks the item type flowing out of the last stage added, so
//! `PipelineBuilder<In, Cur>` only accepts a next transform taking `Cur`.
//! Structural errors (zero workers, zero capacity, closed queues) are
//! remembered and reported by [`PipelineBuilder::build`].

use crate::config::{CancelPolicy, StageConfig};
use crate::error::ConfigError;
use crate::pipeline::failure::{FailureSink, LogOnly};
use crate::pipeline::metrics::Metrics;
use crate::pipeline::runner::Pipeline;
use crate::pipeline::stages::{LaunchStage, Stage, StageContext};
use crate::queue::{BoundedQueue, Closeable, WorkItem};
use crate::transform::Transform;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Capacity of the first queue unless set otherwise.
pub const DEFAULT_INPUT_CAPACITY: usize = 64;

pub struct PipelineBuilder<In, Cur> {
    input: Arc<BoundedQueue<WorkItem<In>>>,
    tail: Arc<BoundedQueue<WorkItem<Cur>>>,
    output_external: bool,
    stages: Vec<Box<dyn LaunchStage>>,
    links: Vec<Arc<dyn Closeable>>,
    sink: Arc<dyn FailureSink>,
    cancel: CancellationToken,
    policy: CancelPolicy,
    metrics: Option<Arc<Metrics>>,
    error: Option<ConfigError>,
}

impl<In: Send + 'static> PipelineBuilder<In, In> {
    pub fn new() -> Self {
        let input = Arc::new(BoundedQueue::with_min_capacity(DEFAULT_INPUT_CAPACITY));
        Self {
            tail: input.clone(),
            input,
            output_external: false,
            stages: Vec::new(),
            links: Vec::new(),
            sink: Arc::new(LogOnly),
            cancel: CancellationToken::new(),
            policy: CancelPolicy::default(),
            metrics: None,
            error: None,
        }
    }

    /// Capacity of the queue feeding the first stage.
    pub fn input_capacity(mut self, capacity: usize) -> Self {
        if !self.stages.is_empty() {
            self.fail(ConfigError::Wiring("input must be configured before the first stage".to_string()));
            return self;
        }
        if capacity == 0 {
            self.fail(ConfigError::ZeroCapacity("pipeline input".to_string()));
            return self;
        }
        let input = Arc::new(BoundedQueue::with_min_capacity(capacity));
        self.tail = input.clone();
        self.input = input;
        self
    }

    /// Feed the first stage from a caller-owned queue.
    pub fn with_input(mut self, queue: Arc<BoundedQueue<WorkItem<In>>>) -> Self {
        if !self.stages.is_empty() {
            self.fail(ConfigError::Wiring("input must be configured before the first stage".to_string()));
            return self;
        }
        if queue.is_closed() {
            self.fail(ConfigError::QueueAlreadyClosed("pipeline input".to_string()));
            return self;
        }
        self.tail = queue.clone();
        self.input = queue;
        self
    }
}

impl<In: Send + 'static> Default for PipelineBuilder<In, In> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In, Cur> PipelineBuilder<In, Cur>
where
    In: Send + 'static,
    Cur: Send + 'static,
{
    fn fail(&mut self, error: ConfigError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Append a stage whose output queue the pipeline creates and owns.
    pub fn stage<Out, X>(mut self, config: StageConfig, transform: X) -> PipelineBuilder<In, Out>
    where
        Out: Send + 'static,
        X: Transform<Cur, Out>,
    {
        if config.capacity == 0 {
            self.fail(ConfigError::ZeroCapacity(format!("stage '{}' output", config.name)));
        }
        let output = Arc::new(BoundedQueue::with_min_capacity(config.capacity));
        self.push_stage(config, transform, output, false)
    }

    /// Append a final stage writing into a caller-owned queue.
    ///
    /// The pipeline still closes `output` once the stage drains, but never
    /// reads from it: [`RunningPipeline::output`](super::RunningPipeline::output)
    /// returns `None` and `join` leaves its contents alone.
    pub fn stage_into<Out, X>(
        self,
        config: StageConfig,
        transform: X,
        output: Arc<BoundedQueue<WorkItem<Out>>>,
    ) -> PipelineBuilder<In, Out>
    where
        Out: Send + 'static,
        X: Transform<Cur, Out>,
    {
        self.push_stage(config, transform, output, true)
    }

    fn push_stage<Out, X>(
        mut self,
        config: StageConfig,
        transform: X,
        output: Arc<BoundedQueue<WorkItem<Out>>>,
        output_external: bool,
    ) -> PipelineBuilder<In, Out>
    where
        Out: Send + 'static,
        X: Transform<Cur, Out>,
    {
        match Stage::new(config.name, config.workers, self.tail.clone(), output.clone(), transform) {
            Ok(stage) => self.stages.push(Box::new(stage)),
            Err(e) => self.fail(e),
        }
        self.links.push(output.clone());

        PipelineBuilder {
            input: self.input,
            tail: output,
            output_external,
            stages: self.stages,
            links: self.links,
            sink: self.sink,
            cancel: self.cancel,
            policy: self.policy,
            metrics: self.metrics,
            error: self.error,
        }
    }

    /// Where per-item transform failures go. Defaults to [`LogOnly`].
    pub fn failure_sink(mut self, sink: Arc<dyn FailureSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Cancel the pipeline when `token` is cancelled.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_policy(mut self, policy: CancelPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Record counters into `metrics` instead of a private instance.
    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Check the wiring and produce a pipeline ready to start.
    pub fn build(self) -> Result<Pipeline<In, Cur>, ConfigError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        if self.stages.is_empty() {
            return Err(ConfigError::Wiring("pipeline has no stages".to_string()));
        }

        let mut links: Vec<Arc<dyn Closeable>> = Vec::with_capacity(self.links.len() + 1);
        links.push(self.input.clone());
        links.extend(self.links);

        tracing::debug!(
            "Built pipeline: {}",
            self.stages.iter().map(|s| s.name()).collect::<Vec<_>>().join(" → ")
        );

        Ok(Pipeline {
            input: self.input,
            output: self.tail,
            output_external: self.output_external,
            stages: self.stages,
            links,
            ctx: StageContext {
                cancel: self.cancel,
                policy: self.policy,
                sink: self.sink,
                metrics: self.metrics.unwrap_or_else(Metrics::new),
            },
        })
    }
}
