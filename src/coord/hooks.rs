//! Run observers for coordinator-based execution
//!
//! Observers are notified as a run progresses. They only see immutable views and
//! can never change the course of a run.

use async_trait::async_trait;
use std::sync::Arc;

use crate::coord::state::SharedState;
use crate::coord::types::{ExecutionResult, TaskId};

/// Receives progress notifications from the coordinator
#[async_trait]
pub trait RunObserver: Send + Sync {
    /// Called once the run has moved to `running`
    async fn on_start(&self, _state: &SharedState) {}

    /// Called with the ready set right before it is dispatched
    async fn on_dispatch(&self, _run_id: &str, _iteration: u32, _tasks: &[TaskId]) {}

    /// Called for each task result, before the batch is merged
    async fn on_task_finished(&self, _run_id: &str, _task_id: &str, _result: &ExecutionResult) {}

    /// Called after a superstep's batch has been merged
    async fn on_superstep(&self, _state: &SharedState) {}

    /// Called once with the terminal state
    async fn on_complete(&self, _state: &SharedState) {}
}

/// Composite observer that fans out to several observers in order
#[derive(Default)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn RunObserver>>,
}

impl CompositeObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_observer(&mut self, observer: Arc<dyn RunObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

#[async_trait]
impl RunObserver for CompositeObserver {
    async fn on_start(&self, state: &SharedState) {
        for observer in &self.observers {
            observer.on_start(state).await;
        }
    }

    async fn on_dispatch(&self, run_id: &str, iteration: u32, tasks: &[TaskId]) {
        for observer in &self.observers {
            observer.on_dispatch(run_id, iteration, tasks).await;
        }
    }

    async fn on_task_finished(&self, run_id: &str, task_id: &str, result: &ExecutionResult) {
        for observer in &self.observers {
            observer.on_task_finished(run_id, task_id, result).await;
        }
    }

    async fn on_superstep(&self, state: &SharedState) {
        for observer in &self.observers {
            observer.on_superstep(state).await;
        }
    }

    async fn on_complete(&self, state: &SharedState) {
        for observer in &self.observers {
            observer.on_complete(state).await;
        }
    }
}

/// Observer that writes a line per event to `tracing`
pub struct LoggingObserver;

#[async_trait]
impl RunObserver for LoggingObserver {
    async fn on_start(&self, state: &SharedState) {
        tracing::info!(
            run_id = %state.run_id(),
            variant = %state.variant(),
            "Run started"
        );
    }

    async fn on_dispatch(&self, run_id: &str, iteration: u32, tasks: &[TaskId]) {
        tracing::info!(run_id, iteration, "Dispatching {:?}", tasks);
    }

    async fn on_task_finished(&self, run_id: &str, task_id: &str, result: &ExecutionResult) {
        match result {
            ExecutionResult::Success { .. } => {
                tracing::info!(run_id, task_id, "Task completed");
            }
            ExecutionResult::Failure { kind, reason } => {
                tracing::error!(run_id, task_id, kind = kind.as_str(), "Task failed: {}", reason);
            }
        }
    }

    async fn on_complete(&self, state: &SharedState) {
        match state.diagnostic() {
            Some(diag) => tracing::error!(
                run_id = %state.run_id(),
                status = %state.status(),
                "Run finished: {}",
                diag
            ),
            None => tracing::info!(
                run_id = %state.run_id(),
                status = %state.status(),
                "Run finished"
            ),
        }
    }
}
