use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::core::errors::{BoardError, Result};

/// Coordinator configuration with all tuning parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Default per-task execution timeout
    #[serde(rename = "task_timeout_ms", with = "duration_millis")]
    pub task_timeout: Duration,
    /// Maximum number of supersteps before the run is force-failed
    pub max_iterations: u32,
    /// Pause between supersteps; throughput tuning only
    #[serde(rename = "superstep_delay_ms", with = "duration_millis")]
    pub superstep_delay: Duration,
    /// Maximum executors running at once inside a superstep
    pub max_concurrent_tasks: usize,
    /// Write checkpoints to the state store after every merge
    pub checkpoint_enabled: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(60),
            max_iterations: 20,
            superstep_delay: Duration::from_millis(100),
            max_concurrent_tasks: 10,
            checkpoint_enabled: true,
        }
    }
}

impl CoordinatorConfig {
    /// Create a new builder for CoordinatorConfig
    pub fn builder() -> CoordinatorConfigBuilder {
        CoordinatorConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.task_timeout.is_zero() {
            return Err(BoardError::configuration_field(
                "task_timeout must be greater than 0",
                "task_timeout",
            ));
        }
        if self.max_iterations == 0 {
            return Err(BoardError::configuration_field(
                "max_iterations must be greater than 0",
                "max_iterations",
            ));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(BoardError::configuration_field(
                "max_concurrent_tasks must be greater than 0",
                "max_concurrent_tasks",
            ));
        }
        if self.max_concurrent_tasks > Semaphore::MAX_PERMITS {
            return Err(BoardError::configuration_field(
                format!(
                    "max_concurrent_tasks cannot exceed {}",
                    Semaphore::MAX_PERMITS
                ),
                "max_concurrent_tasks",
            ));
        }
        Ok(())
    }

    /// Configuration for tests and local runs: short timeouts, no inter-step pause
    pub fn development() -> Self {
        Self {
            task_timeout: Duration::from_secs(5),
            superstep_delay: Duration::ZERO,
            max_concurrent_tasks: 4,
            ..Default::default()
        }
    }

    /// Configuration for long-running generative tasks
    pub fn production() -> Self {
        Self {
            task_timeout: Duration::from_secs(120),
            max_concurrent_tasks: 16,
            ..Default::default()
        }
    }

    /// Parse a YAML document; missing fields fall back to defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML configuration file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| BoardError::Io {
            operation: format!("read config {}", path.display()),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }
}

/// Builder for CoordinatorConfig
pub struct CoordinatorConfigBuilder {
    config: CoordinatorConfig,
}

impl CoordinatorConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: CoordinatorConfig::default(),
        }
    }

    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.config.task_timeout = timeout;
        self
    }

    pub fn max_iterations(mut self, max_iterations: u32) -> Self {
        self.config.max_iterations = max_iterations;
        self
    }

    pub fn superstep_delay(mut self, delay: Duration) -> Self {
        self.config.superstep_delay = delay;
        self
    }

    pub fn max_concurrent_tasks(mut self, max: usize) -> Self {
        self.config.max_concurrent_tasks = max;
        self
    }

    /// Enable/disable per-superstep checkpoints
    pub fn checkpoints(mut self, enabled: bool) -> Self {
        self.config.checkpoint_enabled = enabled;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<CoordinatorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for CoordinatorConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// Durations are written as integer milliseconds in config files
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
