//! Core types for superstep coordination
//!
//! Everything here is plain data: seeds, statuses, execution results and the
//! diagnostics a failed run carries back to its caller.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::core::errors::{BoardError, Result};

/// Stable identifier of a registered task
pub type TaskId = String;

/// Selects which subset of the registry applies to a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    NaturalDisaster,
    EconomicCrisis,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::NaturalDisaster => "natural_disaster",
            Variant::EconomicCrisis => "economic_crisis",
        }
    }

    pub fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s {
            "natural_disaster" => Ok(Variant::NaturalDisaster),
            "economic_crisis" => Ok(Variant::EconomicCrisis),
            _ => Err(format!("Unknown variant: {}", s)),
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The run's input record; immutable once a state is created from it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Seed {
    pub run_id: String,
    pub variant: Variant,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Seed {
    /// Create a seed with a freshly generated run id
    pub fn new(variant: Variant) -> Self {
        Self::with_run_id(uuid::Uuid::new_v4().to_string(), variant)
    }

    /// Create a seed with a caller-chosen run id
    pub fn with_run_id(run_id: impl Into<String>, variant: Variant) -> Self {
        Self {
            run_id: run_id.into(),
            variant,
            payload: Map::new(),
        }
    }

    /// Attach the opaque payload passed through to executors
    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    /// Build a seed from a loosely shaped JSON record.
    ///
    /// The run id is read from `run_id` (or `task_id`), the variant from
    /// `variant` (or `crisis_mode`). The whole object is kept as payload.
    pub fn from_value(value: Value) -> Result<Self> {
        let object = match value {
            Value::Object(object) => object,
            other => {
                return Err(BoardError::validation(format!(
                    "seed must be a JSON object, got {}",
                    type_name(&other)
                )))
            }
        };

        let run_id = object
            .get("run_id")
            .or_else(|| object.get("task_id"))
            .and_then(Value::as_str)
            .ok_or_else(|| BoardError::validation_field("seed is missing run_id", "run_id"))?
            .to_string();

        let variant_raw = object
            .get("variant")
            .or_else(|| object.get("crisis_mode"))
            .and_then(Value::as_str)
            .ok_or_else(|| BoardError::validation_field("seed is missing variant", "variant"))?;
        let variant =
            Variant::from_str(variant_raw).map_err(|e| BoardError::validation_field(e, "variant"))?;

        let seed = Self {
            run_id,
            variant,
            payload: object,
        };
        seed.validate()?;
        Ok(seed)
    }

    /// Check the identifying fields
    pub fn validate(&self) -> Result<()> {
        if self.run_id.trim().is_empty() {
            return Err(BoardError::validation_field(
                "run_id cannot be empty",
                "run_id",
            ));
        }
        Ok(())
    }

    /// Get a payload value by key
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<T> {
        let value = self
            .payload
            .get(key)
            .ok_or_else(|| anyhow::anyhow!("Payload field '{}' not found", key))?;
        serde_json::from_value(value.clone())
            .map_err(|e| anyhow::anyhow!("Failed to deserialize payload field '{}': {}", key, e))
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Initialized,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Initialized => "initialized",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s {
            "initialized" => Ok(RunStatus::Initialized),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            _ => Err(format!("Unknown run status: {}", s)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where one task stands within a run, as reported to status queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Applicable and not finished yet
    Waiting,
    Complete,
    Failed,
    /// Not applicable to the run's seed
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Complete => "complete",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Usage reported by one task; folded additively into the run metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsDelta {
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost_estimate: f64,
    #[serde(default)]
    pub counters: BTreeMap<String, u64>,
}

impl MetricsDelta {
    pub fn tokens(tokens_used: u64) -> Self {
        Self {
            tokens_used,
            ..Default::default()
        }
    }

    pub fn with_cost(mut self, cost_estimate: f64) -> Self {
        self.cost_estimate = cost_estimate;
        self
    }

    pub fn with_counter(mut self, name: impl Into<String>, value: u64) -> Self {
        *self.counters.entry(name.into()).or_insert(0) += value;
        self
    }
}

/// Kinds of entries in a run's error log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TaskTimeout,
    TaskExecution,
    Deadlock,
    IterationCapExceeded,
    RequiredTaskFailed,
    Conflict,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TaskTimeout => "task_timeout",
            ErrorKind::TaskExecution => "task_execution",
            ErrorKind::Deadlock => "deadlock",
            ErrorKind::IterationCapExceeded => "iteration_cap_exceeded",
            ErrorKind::RequiredTaskFailed => "required_task_failed",
            ErrorKind::Conflict => "conflict",
        }
    }
}

/// Outcome of one executor call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionResult {
    Success {
        patch: Value,
        #[serde(default)]
        metrics: MetricsDelta,
    },
    Failure {
        kind: ErrorKind,
        reason: String,
    },
}

impl ExecutionResult {
    /// A successful result with no usage metrics
    pub fn success(patch: Value) -> Self {
        Self::Success {
            patch,
            metrics: MetricsDelta::default(),
        }
    }

    pub fn success_with_metrics(patch: Value, metrics: MetricsDelta) -> Self {
        Self::Success { patch, metrics }
    }

    /// A failure raised by the task itself
    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure {
            kind: ErrorKind::TaskExecution,
            reason: reason.into(),
        }
    }

    /// A failure forced by the per-task timeout
    pub fn timed_out(task_id: &str, timeout: Duration) -> Self {
        Self::Failure {
            kind: ErrorKind::TaskTimeout,
            reason: BoardError::task_timeout(task_id, timeout).to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// One append-only error log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    /// None for run-level errors
    pub task_id: Option<TaskId>,
    pub kind: ErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// A pending task and the precondition it is still waiting for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTask {
    pub task_id: TaskId,
    pub unmet: String,
}

/// Why a run ended in `Failed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RunDiagnostic {
    Deadlock {
        pending: Vec<PendingTask>,
        /// Groups of pending tasks whose preconditions wait on each other
        #[serde(default)]
        cycles: Vec<Vec<TaskId>>,
    },
    IterationCapExceeded {
        iterations: u32,
        pending: Vec<TaskId>,
    },
    RequiredTaskFailed {
        failed: Vec<TaskId>,
    },
    Conflict {
        message: String,
    },
}

impl RunDiagnostic {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RunDiagnostic::Deadlock { .. } => ErrorKind::Deadlock,
            RunDiagnostic::IterationCapExceeded { .. } => ErrorKind::IterationCapExceeded,
            RunDiagnostic::RequiredTaskFailed { .. } => ErrorKind::RequiredTaskFailed,
            RunDiagnostic::Conflict { .. } => ErrorKind::Conflict,
        }
    }

    /// Ids the run was still waiting on when it stopped
    pub fn pending_ids(&self) -> Vec<&str> {
        match self {
            RunDiagnostic::Deadlock { pending, .. } => {
                pending.iter().map(|p| p.task_id.as_str()).collect()
            }
            RunDiagnostic::IterationCapExceeded { pending, .. } => {
                pending.iter().map(String::as_str).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Equivalent run-level error, for callers that prefer `Result`
    pub fn to_error(&self) -> BoardError {
        match self {
            RunDiagnostic::Deadlock { pending, .. } => BoardError::Deadlock {
                pending: pending.iter().map(|p| p.task_id.clone()).collect(),
            },
            RunDiagnostic::IterationCapExceeded {
                iterations,
                pending,
            } => BoardError::IterationCapExceeded {
                iterations: *iterations,
                pending: pending.clone(),
            },
            RunDiagnostic::RequiredTaskFailed { failed } => BoardError::TaskExecution {
                task_id: failed.join(","),
                reason: "required task failed".to_string(),
            },
            RunDiagnostic::Conflict { message } => BoardError::Conflict {
                message: message.clone(),
                task_id: None,
            },
        }
    }
}

impl fmt::Display for RunDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunDiagnostic::Deadlock { pending, cycles } => {
                write!(f, "deadlock: no task ready, pending [")?;
                for (i, p) in pending.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} (waiting on {})", p.task_id, p.unmet)?;
                }
                write!(f, "]")?;
                for cycle in cycles {
                    write!(f, "; dependency cycle {}", cycle.join(" -> "))?;
                }
                Ok(())
            }
            RunDiagnostic::IterationCapExceeded {
                iterations,
                pending,
            } => write!(
                f,
                "iteration cap exceeded after {} supersteps, pending [{}]",
                iterations,
                pending.join(", ")
            ),
            RunDiagnostic::RequiredTaskFailed { failed } => {
                write!(f, "required tasks failed: [{}]", failed.join(", "))
            }
            RunDiagnostic::Conflict { message } => write!(f, "conflicting batch: {}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_seed_from_crisis_profile() {
        let seed = Seed::from_value(json!({
            "task_id": "a1b2",
            "crisis_mode": "economic_crisis",
            "budget_tier": 100
        }))
        .unwrap();

        assert_eq!(seed.run_id, "a1b2");
        assert_eq!(seed.variant, Variant::EconomicCrisis);
        assert_eq!(seed.get::<u32>("budget_tier").unwrap(), 100);
    }

    #[test]
    fn test_seed_missing_identifiers() {
        let err = Seed::from_value(json!({"variant": "natural_disaster"})).unwrap_err();
        assert!(matches!(err, BoardError::Validation { field: Some(ref f), .. } if f == "run_id"));

        let err = Seed::from_value(json!({"run_id": "r1"})).unwrap_err();
        assert!(matches!(err, BoardError::Validation { field: Some(ref f), .. } if f == "variant"));

        let err = Seed::from_value(json!({"run_id": "  ", "variant": "natural_disaster"}))
            .unwrap_err();
        assert_eq!(err.category(), "validation");

        assert!(Seed::from_value(json!(["not", "an", "object"])).is_err());
    }

    #[test]
    fn test_seed_unknown_variant() {
        let err = Seed::from_value(json!({"run_id": "r1", "variant": "zombie_outbreak"}))
            .unwrap_err();
        assert!(err.to_string().contains("zombie_outbreak"));
    }

    #[test]
    fn test_generated_run_ids_are_unique() {
        let a = Seed::new(Variant::NaturalDisaster);
        let b = Seed::new(Variant::NaturalDisaster);
        assert!(a.validate().is_ok());
        assert_ne!(a.run_id, b.run_id);
    }

    #[test]
    fn test_execution_result_wire_shape() {
        let result = ExecutionResult::timed_out("supply_planning", Duration::from_secs(60));
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["outcome"], "failure");
        assert_eq!(value["kind"], "task_timeout");
        assert!(!result.is_success());
    }

    #[test]
    fn test_diagnostic_display() {
        let diag = RunDiagnostic::Deadlock {
            pending: vec![PendingTask {
                task_id: "s".into(),
                unmet: "completed: r".into(),
            }],
            cycles: vec![],
        };
        assert_eq!(
            diag.to_string(),
            "deadlock: no task ready, pending [s (waiting on completed: r)]"
        );
        assert_eq!(diag.pending_ids(), vec!["s"]);
        assert_eq!(diag.kind(), ErrorKind::Deadlock);
    }
}
