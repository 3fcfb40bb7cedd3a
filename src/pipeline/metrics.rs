//! Throughput monitoring and metrics collection.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Counters for a single stage.
#[derive(Debug)]
pub struct StageMetrics {
    /// Stage name
    pub name: String,

    /// Configured worker count
    pub workers: usize,

    /// Items taken from the input queue
    pub taken: AtomicU64,

    /// Results put to the output queue
    pub emitted: AtomicU64,

    /// Items whose transform failed
    pub failed: AtomicU64,

    /// Time spent inside the transform (microseconds, summed across workers)
    pub busy_us: AtomicU64,

    /// Every worker exited because the input drained, not because of a cancel
    pub drained: AtomicBool,
}

impl StageMetrics {
    fn new(name: &str, workers: usize) -> Self {
        Self {
            name: name.to_string(),
            workers,
            taken: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            busy_us: AtomicU64::new(0),
            drained: AtomicBool::new(false),
        }
    }

    pub fn add_taken(&self) {
        self.taken.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_emitted(&self) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_drained(&self) {
        self.drained.store(true, Ordering::SeqCst);
    }

    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::SeqCst)
    }

    /// Record time spent transforming one item.
    pub fn add_busy_time(&self, duration: Duration) {
        self.busy_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StageSnapshot {
        StageSnapshot {
            name: self.name.clone(),
            workers: self.workers,
            taken: self.taken.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            busy_secs: self.busy_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

/// Metrics for one pipeline run.
///
/// A pipeline resets the metrics it is given when it starts, so sharing one
/// `Metrics` across runs reports the latest run only.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Items accepted into the first queue
    pub items_fed: AtomicU64,

    /// Transform failures across all stages
    pub failures: AtomicU64,

    /// Start time
    start_time: Mutex<Option<Instant>>,

    /// Per-stage counters, in pipeline order
    stages: Mutex<Vec<Arc<StageMetrics>>>,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            items_fed: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            start_time: Mutex::new(Some(Instant::now())),
            stages: Mutex::new(Vec::new()),
        })
    }

    /// Forget every stage and counter and restart the clock.
    pub(crate) fn reset(&self) {
        self.items_fed.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        *self.start_time.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        self.stages.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Register a stage; counters are reported in registration order.
    pub fn register_stage(&self, name: &str, workers: usize) -> Arc<StageMetrics> {
        let stage = Arc::new(StageMetrics::new(name, workers));
        self.stages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(stage.clone());
        stage
    }

    /// Record an item accepted by the first queue.
    pub fn add_item_fed(&self) {
        self.items_fed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a transform failure.
    pub fn add_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Results emitted by the last registered stage.
    pub fn items_out(&self) -> u64 {
        self.stages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .map_or(0, |s| s.emitted.load(Ordering::Relaxed))
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Get output items per second.
    pub fn items_per_second(&self) -> f64 {
        let items = self.items_out();
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            items as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let stages = self
            .stages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|s| s.snapshot())
            .collect();

        MetricsSnapshot {
            items_fed: self.items_fed.load(Ordering::Relaxed),
            items_out: self.items_out(),
            failures: self.failures.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            items_per_second: self.items_per_second(),
            stages,
        }
    }
}

/// Per-stage part of a [`MetricsSnapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct StageSnapshot {
    pub name: String,
    pub workers: usize,
    pub taken: u64,
    pub emitted: u64,
    pub failed: u64,
    /// Total time inside the transform (seconds, summed across workers)
    pub busy_secs: f64,
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub items_fed: u64,
    pub items_out: u64,
    pub failures: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub items_per_second: f64,
    pub stages: Vec<StageSnapshot>,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Items: {} in, {} out | Failures: {} | Rate: {:.1} items/s | Elapsed: {:.1}s",
            self.items_fed,
            self.items_out,
            self.failures,
            self.items_per_second,
            self.elapsed.as_secs_f64(),
        )?;

        for stage in &self.stages {
            write!(
                f,
                " | {}: {}→{} ({} failed)",
                stage.name, stage.taken, stage.emitted, stage.failed
            )?;
        }
        Ok(())
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    expected_items: u64,
}

impl MetricsReporter {
    /// Create a new metrics reporter.
    ///
    /// `expected_items` drives the progress percentage; pass 0 when unknown.
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, expected_items: u64) -> Self {
        Self {
            metrics,
            interval_secs: interval_secs.max(1),
            expected_items,
        }
    }

    /// Start the periodic reporter.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    let progress = if self.expected_items > 0 {
                        snapshot.items_fed as f64 / self.expected_items as f64 * 100.0
                    } else {
                        0.0
                    };

                    tracing::info!("[{:.1}%] {}", progress, snapshot);
                }
                _ = shutdown.recv() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("Final: {}", snapshot);
                    break;
                }
            }
        }
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        let snapshot = self.metrics.snapshot();

        println!("\n=== Pipeline Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Items fed: {}", snapshot.items_fed);
        println!("Items out: {}", snapshot.items_out);
        println!("Failures: {}", snapshot.failures);
        println!("Processing rate: {:.1} items/s", snapshot.items_per_second);

        let total_busy: f64 = snapshot.stages.iter().map(|s| s.busy_secs).sum();
        if !snapshot.stages.is_empty() {
            println!("\n--- Stage Breakdown ---");
            for stage in &snapshot.stages {
                let share = if total_busy > 0.0 {
                    stage.busy_secs / total_busy * 100.0
                } else {
                    0.0
                };
                println!(
                    "{:<12} x{:<3} taken {:>7} emitted {:>7} failed {:>5} busy {:>7.1}s ({:>5.1}%)",
                    stage.name, stage.workers, stage.taken, stage.emitted, stage.failed, stage.busy_secs, share
                );
            }
        }
        println!("========================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();

        metrics.add_item_fed();
        metrics.add_item_fed();
        metrics.add_failure();

        assert_eq!(metrics.items_fed.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.failures.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_items_out_tracks_last_stage() {
        let metrics = Metrics::new();
        assert_eq!(metrics.items_out(), 0);

        let first = metrics.register_stage("parse", 2);
        let last = metrics.register_stage("square", 4);

        first.add_emitted();
        first.add_emitted();
        last.add_emitted();

        assert_eq!(metrics.items_out(), 1);
    }

    #[test]
    fn test_reset_forgets_previous_run() {
        let metrics = Metrics::new();
        metrics.add_item_fed();
        metrics.add_failure();
        metrics.register_stage("old", 1).add_emitted();

        metrics.reset();
        let stage = metrics.register_stage("new", 2);
        stage.add_emitted();
        stage.add_emitted();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.items_fed, 0);
        assert_eq!(snapshot.failures, 0);
        assert_eq!(snapshot.items_out, 2);
        assert_eq!(snapshot.stages.len(), 1);
        assert_eq!(snapshot.stages[0].name, "new");
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = Metrics::new();
        let stage = metrics.register_stage("square", 3);

        metrics.add_item_fed();
        stage.add_taken();
        stage.add_emitted();
        stage.add_taken();
        stage.add_failed();
        stage.add_busy_time(Duration::from_millis(250));

        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.items_fed, 1);
        assert_eq!(snapshot.items_out, 1);
        assert_eq!(snapshot.stages.len(), 1);
        assert_eq!(snapshot.stages[0].name, "square");
        assert_eq!(snapshot.stages[0].workers, 3);
        assert_eq!(snapshot.stages[0].taken, 2);
        assert_eq!(snapshot.stages[0].failed, 1);
        assert!((snapshot.stages[0].busy_secs - 0.25).abs() < 0.001);
    }

    #[test]
    fn test_snapshot_display() {
        let snapshot = MetricsSnapshot {
            items_fed: 100,
            items_out: 90,
            failures: 10,
            elapsed: Duration::from_secs(10),
            items_per_second: 9.0,
            stages: vec![StageSnapshot {
                name: "square".to_string(),
                workers: 4,
                taken: 100,
                emitted: 90,
                failed: 10,
                busy_secs: 1.5,
            }],
        };

        let display = format!("{}", snapshot);

        assert!(display.contains("100 in"));
        assert!(display.contains("90 out"));
        assert!(display.contains("Failures: 10"));
        assert!(display.contains("square: 100→90 (10 failed)"));
    }

    #[test]
    fn test_save_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        let path = path.to_str().unwrap();

        let metrics = Metrics::new();
        metrics.register_stage("identity", 1).add_emitted();
        metrics.snapshot().save_to_file(path).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json["items_out"], 1);
        assert_eq!(json["stages"][0]["name"], "identity");
    }

    #[test]
    fn test_zero_elapsed_no_panic() {
        let metrics = Metrics::default();

        assert_eq!(metrics.elapsed(), Duration::ZERO);
        assert_eq!(metrics.items_per_second(), 0.0);
    }

    #[test]
    fn test_metrics_reporter_new() {
        let metrics = Metrics::new();
        let reporter = MetricsReporter::new(metrics, 0, 1000);

        assert_eq!(reporter.interval_secs, 1);
        assert_eq!(reporter.expected_items, 1000);
    }

    #[tokio::test]
    async fn test_metrics_reporter_stops_on_shutdown() {
        let metrics = Metrics::new();
        let reporter = MetricsReporter::new(metrics, 60, 0);
        let (tx, rx) = mpsc::channel(1);

        let handle = tokio::spawn(reporter.run(rx));
        tx.send(()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("reporter should stop")
            .unwrap();
    }
}
