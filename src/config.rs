//! Configuration for stagepipe runs.

use crate::pipeline::ChunkPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Pipeline topology
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// Fork-join aggregation
    #[serde(default)]
    pub fork_join: ForkJoinConfig,

    /// Runtime and reporting
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Stages and queue sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Capacity of the queue feeding the first stage
    #[serde(default = "default_capacity")]
    pub input_capacity: usize,

    /// What workers do with their in-flight item when cancelled
    #[serde(default)]
    pub cancel_policy: CancelPolicy,

    /// Stages in execution order
    #[serde(default = "default_stages")]
    pub stages: Vec<StageConfig>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            input_capacity: default_capacity(),
            cancel_policy: CancelPolicy::default(),
            stages: default_stages(),
        }
    }
}

/// One stage of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Stage name, used in logs, failures and metrics
    pub name: String,

    /// Number of concurrent workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Capacity of this stage's output queue
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Built-in transform name (CLI only), e.g. `square` or `expand:3`
    #[serde(default = "default_transform")]
    pub transform: String,
}

impl StageConfig {
    /// A stage with the given name and worker count and default capacity.
    pub fn new(name: impl Into<String>, workers: usize) -> Self {
        Self {
            name: name.into(),
            workers,
            capacity: default_capacity(),
            transform: default_transform(),
        }
    }

    /// Set the output queue capacity.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Behaviour of a worker holding an item when cancellation arrives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelPolicy {
    /// Drop the in-flight item at the transform's next suspension point.
    #[default]
    Abandon,
    /// Let the transform finish; its results are then dropped, not put
    /// downstream.
    FinishInFlight,
}

/// Fork-join configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForkJoinConfig {
    /// Fixed chunk count; unset means one chunk per available core
    #[serde(default)]
    pub chunks: Option<usize>,
}

impl ForkJoinConfig {
    pub fn chunk_policy(&self) -> ChunkPolicy {
        match self.chunks {
            Some(n) => ChunkPolicy::Fixed(n),
            None => ChunkPolicy::AvailableWorkers,
        }
    }
}

/// Runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Enable metrics reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            // YAML is a superset of JSON
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pipeline.stages.is_empty() {
            anyhow::bail!("Pipeline must have at least one stage");
        }
        if self.pipeline.input_capacity == 0 {
            anyhow::bail!("Input capacity must be > 0");
        }

        let mut names = std::collections::HashSet::new();
        for stage in &self.pipeline.stages {
            if stage.name.is_empty() {
                anyhow::bail!("Stage names must not be empty");
            }
            if !names.insert(stage.name.as_str()) {
                anyhow::bail!("Duplicate stage name '{}'", stage.name);
            }
            if stage.workers == 0 {
                anyhow::bail!("Stage '{}' must have at least one worker", stage.name);
            }
            if stage.capacity == 0 {
                anyhow::bail!("Stage '{}' capacity must be > 0", stage.name);
            }
        }

        if self.fork_join.chunks == Some(0) {
            anyhow::bail!("Fork-join chunk count must be > 0");
        }
        if self.runtime.worker_threads == Some(0) {
            anyhow::bail!("Worker threads must be > 0");
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_capacity() -> usize { 64 }
fn default_workers() -> usize { 4 }
fn default_transform() -> String { "identity".to_string() }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 10 }

fn default_stages() -> Vec<StageConfig> {
    vec![
        StageConfig {
            name: "square".to_string(),
            workers: 4,
            capacity: 64,
            transform: "square".to_string(),
        },
        StageConfig {
            name: "even".to_string(),
            workers: 2,
            capacity: 64,
            transform: "keep_even".to_string(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pipeline.stages.len(), 2);
        assert_eq!(config.pipeline.cancel_policy, CancelPolicy::Abandon);
        assert_eq!(config.fork_join.chunk_policy(), ChunkPolicy::AvailableWorkers);
    }

    #[test]
    fn test_from_yaml_with_defaults() {
        let yaml = r#"
pipeline:
  input_capacity: 8
  cancel_policy: finish_in_flight
  stages:
    - name: double
      transform: expand:2
    - name: slow
      workers: 16
      capacity: 2
      transform: delay:5
fork_join:
  chunks: 4
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert!(config.validate().is_ok());

        assert_eq!(config.pipeline.input_capacity, 8);
        assert_eq!(config.pipeline.cancel_policy, CancelPolicy::FinishInFlight);
        assert_eq!(config.pipeline.stages[0].workers, 4);
        assert_eq!(config.pipeline.stages[0].capacity, 64);
        assert_eq!(config.pipeline.stages[1].workers, 16);
        assert_eq!(config.fork_join.chunk_policy(), ChunkPolicy::Fixed(4));
        assert!(config.runtime.enable_metrics);
    }

    #[test]
    fn test_from_json() {
        let json = r#"{"pipeline": {"stages": [{"name": "only", "workers": 1}]}}"#;
        let config = Config::from_json(json).unwrap();
        assert_eq!(config.pipeline.stages, vec![StageConfig::new("only", 1)]);
    }

    #[test]
    fn test_yaml_round_trip_through_file() {
        let config = Config::default();
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(config.to_yaml().unwrap().as_bytes()).unwrap();

        let loaded = Config::from_file(&file.path().to_path_buf()).unwrap();
        assert_eq!(loaded.pipeline.stages, config.pipeline.stages);
    }

    #[test]
    fn test_config_validation_invalid() {
        let mut config = Config::default();
        config.pipeline.stages[1].workers = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pipeline.stages[0].capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pipeline.stages.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pipeline.stages[1].name = "square".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.fork_join.chunks = Some(0);
        assert!(config.validate().is_err());
    }
}
