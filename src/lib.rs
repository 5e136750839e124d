//! Blackboard-style orchestration for multi-section plan generation.
//!
//! A fixed table of tasks cooperates through a shared state. The
//! [`Coordinator`] repeatedly dispatches every task whose preconditions hold,
//! waits for the whole batch, merges the results, checkpoints the state and
//! decides whether the run converged, deadlocked, or must continue.

// Core infrastructure modules
pub mod core;

pub mod catalog;
pub mod coord;
pub mod storage;

// Re-exports for convenience
pub use crate::core::config::{CoordinatorConfig, CoordinatorConfigBuilder};
pub use crate::core::errors::{BoardError, Result};

pub use coord::{
    CompositeObserver, Coordinator, ErrorKind, ErrorLogEntry, ExecutionResult, FnExecutor,
    LoggingObserver, MergeSummary, MetricsDelta, PendingTask, Precondition, RunDiagnostic,
    RunMetrics, RunObserver, RunStatus, Seed, SeedRule, SharedState, StateSnapshot, TaskCtx,
    TaskDescriptor, TaskExecutor, TaskId, TaskOutput, TaskRegistry, TaskRegistryBuilder,
    TaskStatus, Variant,
};
pub use storage::{MemoryStore, SledStore, StateStore, StatusFilter};

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_two_task_run_end_to_end() {
        let registry = TaskRegistry::builder()
            .register(
                TaskDescriptor::new("risk"),
                Arc::new(FnExecutor::new(|_ctx| async {
                    Ok(TaskOutput::new(json!({"level": "severe"})))
                })),
            )
            .register(
                TaskDescriptor::new("supplies").needs(["risk"]),
                Arc::new(FnExecutor::new(|ctx: TaskCtx| async move {
                    let risk: serde_json::Value = ctx.output("risk")?;
                    Ok(TaskOutput::new(json!({"for": risk["level"]})))
                })),
            )
            .build()
            .unwrap();

        let store = Arc::new(MemoryStore::new());
        let coordinator =
            Coordinator::new(registry, store.clone(), CoordinatorConfig::development()).unwrap();
        let state = coordinator
            .run(Seed::with_run_id("e2e", Variant::NaturalDisaster))
            .await
            .unwrap();

        assert_eq!(state.status(), RunStatus::Completed);
        assert_eq!(state.iteration(), 2);
        assert_eq!(state.output("supplies"), Some(&json!({"for": "severe"})));
        assert!(state.invariants_hold());

        let stored = store.get("e2e").await.unwrap().unwrap();
        assert_eq!(stored, state);
    }
}
