//! SharedState - the blackboard every task reads from and the coordinator writes to
//!
//! Executors never see this type. They receive a [`StateSnapshot`] and hand back an
//! [`ExecutionResult`]; the coordinator folds whole batches of results in with
//! [`SharedState::merge`] between supersteps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::coord::registry::TaskRegistry;
use crate::coord::types::{
    ErrorKind, ErrorLogEntry, ExecutionResult, MetricsDelta, RunDiagnostic, RunStatus, Seed,
    TaskId, TaskStatus, Variant,
};
use crate::core::errors::{BoardError, Result};

/// Aggregate usage and the append-only error log of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub tokens_used: u64,
    pub cost_estimate: f64,
    pub counters: BTreeMap<String, u64>,
    pub errors: Vec<ErrorLogEntry>,
}

impl RunMetrics {
    fn absorb(&mut self, delta: &MetricsDelta) {
        self.tokens_used = self.tokens_used.saturating_add(delta.tokens_used);
        if delta.cost_estimate.is_finite() && delta.cost_estimate > 0.0 {
            self.cost_estimate += delta.cost_estimate;
        }
        for (name, value) in &delta.counters {
            let counter = self.counters.entry(name.clone()).or_insert(0);
            *counter = counter.saturating_add(*value);
        }
    }

    fn log(&mut self, task_id: Option<TaskId>, kind: ErrorKind, message: String) {
        self.errors.push(ErrorLogEntry {
            task_id,
            kind,
            message,
            timestamp: Utc::now(),
        });
    }

    /// Error log entries recorded for one task
    pub fn errors_for<'a>(&'a self, task_id: &'a str) -> impl Iterator<Item = &'a ErrorLogEntry> {
        self.errors
            .iter()
            .filter(move |e| e.task_id.as_deref() == Some(task_id))
    }
}

/// What a merge changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub succeeded: Vec<TaskId>,
    pub failed: Vec<TaskId>,
}

/// The run's blackboard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedState {
    run_id: String,
    seed: Seed,
    outputs: BTreeMap<TaskId, Value>,
    completed: BTreeSet<TaskId>,
    failed: BTreeSet<TaskId>,
    status: RunStatus,
    metrics: RunMetrics,
    iteration: u32,
    diagnostic: Option<RunDiagnostic>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl SharedState {
    /// Create a fresh state from a validated seed
    pub fn init(seed: Seed) -> Result<Self> {
        seed.validate()?;
        let now = Utc::now();
        Ok(Self {
            run_id: seed.run_id.clone(),
            seed,
            outputs: BTreeMap::new(),
            completed: BTreeSet::new(),
            failed: BTreeSet::new(),
            status: RunStatus::Initialized,
            metrics: RunMetrics::default(),
            iteration: 0,
            diagnostic: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn seed(&self) -> &Seed {
        &self.seed
    }

    pub fn variant(&self) -> Variant {
        self.seed.variant
    }

    pub fn outputs(&self) -> &BTreeMap<TaskId, Value> {
        &self.outputs
    }

    pub fn output(&self, task_id: &str) -> Option<&Value> {
        self.outputs.get(task_id)
    }

    pub fn completed(&self) -> &BTreeSet<TaskId> {
        &self.completed
    }

    pub fn failed(&self) -> &BTreeSet<TaskId> {
        &self.failed
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn metrics(&self) -> &RunMetrics {
        &self.metrics
    }

    pub fn errors(&self) -> &[ErrorLogEntry] {
        &self.metrics.errors
    }

    /// Number of supersteps executed so far
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Set when the run ended in `Failed`
    pub fn diagnostic(&self) -> Option<&RunDiagnostic> {
        self.diagnostic.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock seconds between start and finish, once both are known
    pub fn total_execution_seconds(&self) -> Option<f64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => {
                Some((end - start).num_milliseconds().max(0) as f64 / 1000.0)
            }
            _ => None,
        }
    }

    /// Whether a task already finished, successfully or not
    pub fn is_finished(&self, task_id: &str) -> bool {
        self.completed.contains(task_id) || self.failed.contains(task_id)
    }

    /// Applicable task ids that have neither completed nor failed, in registration order
    pub fn pending_task_ids(&self, registry: &TaskRegistry) -> Vec<TaskId> {
        registry
            .applicable_ids(&self.seed)
            .into_iter()
            .filter(|id| !self.is_finished(id))
            .collect()
    }

    /// Status of one task in this run; `None` if the registry does not know the id
    pub fn task_status(&self, registry: &TaskRegistry, task_id: &str) -> Option<TaskStatus> {
        let descriptor = registry.descriptor(task_id)?;
        let status = if !descriptor.applies_to(&self.seed) {
            TaskStatus::Skipped
        } else if self.completed.contains(task_id) {
            TaskStatus::Complete
        } else if self.failed.contains(task_id) {
            TaskStatus::Failed
        } else {
            TaskStatus::Waiting
        };
        Some(status)
    }

    /// Status of every registered task, in registration order
    pub fn task_statuses(&self, registry: &TaskRegistry) -> Vec<(TaskId, TaskStatus)> {
        registry
            .ids()
            .into_iter()
            .filter_map(|id| self.task_status(registry, &id).map(|status| (id, status)))
            .collect()
    }

    /// Percentage of applicable tasks completed, rounded down; 100 once the run completed
    pub fn progress(&self, registry: &TaskRegistry) -> u8 {
        if self.status == RunStatus::Completed {
            return 100;
        }
        let applicable = registry.applicable_ids(&self.seed);
        if applicable.is_empty() {
            return 100;
        }
        let done = applicable
            .iter()
            .filter(|id| self.completed.contains(id.as_str()))
            .count();
        (done * 100 / applicable.len()) as u8
    }

    /// Immutable view handed to executors and readiness predicates
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            run_id: Arc::from(self.run_id.as_str()),
            seed: Arc::new(self.seed.clone()),
            outputs: Arc::new(self.outputs.clone()),
            completed: Arc::new(self.completed.clone()),
            iteration: self.iteration,
        }
    }

    /// Apply one superstep's results as a single step.
    ///
    /// The whole batch is checked before anything changes: a repeated task id, a
    /// task that already finished, or an output key that is already present
    /// rejects the batch with `Conflict` and leaves the state untouched.
    pub fn merge(&mut self, batch: Vec<(TaskId, ExecutionResult)>) -> Result<MergeSummary> {
        if self.status.is_terminal() {
            return Err(BoardError::Archived {
                run_id: self.run_id.clone(),
                status: self.status.to_string(),
            });
        }

        let mut seen = BTreeSet::new();
        for (task_id, _) in &batch {
            if !seen.insert(task_id.as_str()) {
                return Err(BoardError::conflict(
                    task_id.as_str(),
                    format!("task {} appears twice in one batch", task_id),
                ));
            }
            if self.is_finished(task_id) {
                return Err(BoardError::conflict(
                    task_id.as_str(),
                    format!("task {} already finished in this run", task_id),
                ));
            }
            if self.outputs.contains_key(task_id) {
                return Err(BoardError::conflict(
                    task_id.as_str(),
                    format!("output {} is already present", task_id),
                ));
            }
        }

        let mut summary = MergeSummary::default();
        for (task_id, result) in batch {
            match result {
                ExecutionResult::Success { patch, metrics } => {
                    self.metrics.absorb(&metrics);
                    self.outputs.insert(task_id.clone(), patch);
                    self.completed.insert(task_id.clone());
                    summary.succeeded.push(task_id);
                }
                ExecutionResult::Failure { kind, reason } => {
                    self.metrics.log(Some(task_id.clone()), kind, reason);
                    self.failed.insert(task_id.clone());
                    summary.failed.push(task_id);
                }
            }
        }
        self.updated_at = Utc::now();

        tracing::debug!(
            run_id = %self.run_id,
            succeeded = summary.succeeded.len(),
            failed = summary.failed.len(),
            "Merged superstep batch"
        );
        Ok(summary)
    }

    /// Checks the set invariants: completed and failed are disjoint, and every
    /// output belongs to a completed task.
    pub fn invariants_hold(&self) -> bool {
        self.completed.is_disjoint(&self.failed)
            && self.outputs.keys().all(|k| self.completed.contains(k))
    }

    pub(crate) fn mark_running(&mut self) {
        let now = Utc::now();
        self.status = RunStatus::Running;
        self.started_at.get_or_insert(now);
        self.updated_at = now;
    }

    pub(crate) fn advance_iteration(&mut self) -> u32 {
        self.iteration += 1;
        self.iteration
    }

    /// Move to a terminal status; a failure diagnostic is also written to the error log
    pub(crate) fn finish(
        &mut self,
        status: RunStatus,
        diagnostic: Option<RunDiagnostic>,
    ) -> Result<()> {
        if self.status.is_terminal() {
            return Err(BoardError::Archived {
                run_id: self.run_id.clone(),
                status: self.status.to_string(),
            });
        }
        if !status.is_terminal() {
            return Err(BoardError::internal(format!(
                "cannot finish run {} with non-terminal status {}",
                self.run_id, status
            )));
        }

        if let Some(diag) = &diagnostic {
            self.metrics.log(None, diag.kind(), diag.to_string());
        }
        let now = Utc::now();
        self.status = status;
        self.diagnostic = diagnostic;
        self.finished_at = Some(now);
        self.updated_at = now;
        Ok(())
    }
}

/// Read-only view of a run at the start of a superstep
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    run_id: Arc<str>,
    seed: Arc<Seed>,
    outputs: Arc<BTreeMap<TaskId, Value>>,
    completed: Arc<BTreeSet<TaskId>>,
    iteration: u32,
}

impl StateSnapshot {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn seed(&self) -> &Seed {
        &self.seed
    }

    pub fn variant(&self) -> Variant {
        self.seed.variant
    }

    pub fn outputs(&self) -> &BTreeMap<TaskId, Value> {
        &self.outputs
    }

    pub fn output(&self, key: &str) -> Option<&Value> {
        self.outputs.get(key)
    }

    pub fn has_output(&self, key: &str) -> bool {
        self.outputs.contains_key(key)
    }

    pub fn completed(&self) -> &BTreeSet<TaskId> {
        &self.completed
    }

    pub fn is_completed(&self, task_id: &str) -> bool {
        self.completed.contains(task_id)
    }

    /// Superstep this snapshot was taken for (0-based)
    pub fn iteration(&self) -> u32 {
        self.iteration
    }
}
