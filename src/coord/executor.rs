//! TaskExecutor - compute-only task implementations
//!
//! Executors read an immutable snapshot of the board and return an
//! [`ExecutionResult`]. They never see or mutate the live state; the coordinator
//! merges their results between supersteps.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::coord::state::StateSnapshot;
use crate::coord::types::{ExecutionResult, MetricsDelta, TaskId};

/// Context for one task execution (immutable, clonable)
#[derive(Clone)]
pub struct TaskCtx {
    pub run_id: String,
    pub task_id: TaskId,
    /// Superstep the task was dispatched in (0-based)
    pub iteration: u32,
    /// Deadline the coordinator enforces for this call
    pub timeout: Duration,
    pub snapshot: StateSnapshot,
    /// Run-scoped application context (clients, settings)
    pub app_data: Option<Arc<dyn Any + Send + Sync>>,
}

impl TaskCtx {
    pub fn new(task_id: impl Into<TaskId>, snapshot: StateSnapshot, timeout: Duration) -> Self {
        Self {
            run_id: snapshot.run_id().to_string(),
            task_id: task_id.into(),
            iteration: snapshot.iteration(),
            timeout,
            snapshot,
            app_data: None,
        }
    }

    pub fn with_app_data(mut self, data: Arc<dyn Any + Send + Sync>) -> Self {
        self.app_data = Some(data);
        self
    }

    /// Borrow the app context as a concrete type
    pub fn app_data<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.app_data.as_ref().and_then(|d| d.downcast_ref::<T>())
    }

    /// Get a seed payload value by key
    pub fn payload<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<T> {
        self.snapshot.seed().get(key)
    }

    /// Get another task's output, deserialized
    pub fn output<T: DeserializeOwned>(&self, task_id: &str) -> anyhow::Result<T> {
        let value = self
            .snapshot
            .output(task_id)
            .ok_or_else(|| anyhow::anyhow!("Output '{}' not found", task_id))?;
        serde_json::from_value(value.clone())
            .map_err(|e| anyhow::anyhow!("Failed to deserialize output '{}': {}", task_id, e))
    }

    /// Get another task's output if it is on the board
    pub fn output_opt<T: DeserializeOwned>(&self, task_id: &str) -> anyhow::Result<Option<T>> {
        match self.snapshot.output(task_id) {
            Some(value) if !value.is_null() => {
                let parsed = serde_json::from_value(value.clone()).map_err(|e| {
                    anyhow::anyhow!("Failed to deserialize output '{}': {}", task_id, e)
                })?;
                Ok(Some(parsed))
            }
            _ => Ok(None),
        }
    }
}

/// A task's implementation.
///
/// Errors are reported through [`ExecutionResult::Failure`], not panics; the
/// coordinator still turns panics and timeouts into failures.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, ctx: &TaskCtx) -> ExecutionResult;
}

/// Successful output of a fallible executor body
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutput {
    pub patch: Value,
    pub metrics: MetricsDelta,
}

impl TaskOutput {
    pub fn new(patch: Value) -> Self {
        Self {
            patch,
            metrics: MetricsDelta::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsDelta) -> Self {
        self.metrics = metrics;
        self
    }
}

impl From<TaskOutput> for ExecutionResult {
    fn from(output: TaskOutput) -> Self {
        ExecutionResult::success_with_metrics(output.patch, output.metrics)
    }
}

type ExecFn = dyn Fn(TaskCtx) -> BoxFuture<'static, anyhow::Result<TaskOutput>> + Send + Sync;

/// Executor backed by an async closure; `Err` becomes a `TaskExecution` failure
pub struct FnExecutor {
    f: Box<ExecFn>,
}

impl FnExecutor {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(TaskCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<TaskOutput>> + Send + 'static,
    {
        Self {
            f: Box::new(move |ctx| f(ctx).boxed()),
        }
    }
}

#[async_trait]
impl TaskExecutor for FnExecutor {
    async fn execute(&self, ctx: &TaskCtx) -> ExecutionResult {
        match (self.f)(ctx.clone()).await {
            Ok(output) => output.into(),
            Err(e) => ExecutionResult::failure(format!("{:#}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::state::SharedState;
    use crate::coord::types::{ErrorKind, Seed, Variant};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Settings {
        region: &'static str,
    }

    fn ctx() -> TaskCtx {
        let mut payload = serde_json::Map::new();
        payload.insert("budget_tier".into(), json!(200));
        let mut state = SharedState::init(
            Seed::with_run_id("run-7", Variant::EconomicCrisis).with_payload(payload),
        )
        .unwrap();
        state
            .merge(vec![(
                "risk".to_string(),
                ExecutionResult::success(json!({"score": 7})),
            )])
            .unwrap();
        TaskCtx::new("supply", state.snapshot(), Duration::from_secs(1))
            .with_app_data(Arc::new(Settings { region: "us-east" }))
    }

    #[test]
    fn test_ctx_accessors() {
        let ctx = ctx();
        assert_eq!(ctx.run_id, "run-7");
        assert_eq!(ctx.payload::<u32>("budget_tier").unwrap(), 200);
        assert_eq!(ctx.output::<Value>("risk").unwrap()["score"], 7);
        assert_eq!(ctx.output_opt::<Value>("video").unwrap(), None);
        assert!(ctx.output::<Value>("video").is_err());
        assert_eq!(ctx.app_data::<Settings>().map(|s| s.region), Some("us-east"));
        assert!(ctx.app_data::<String>().is_none());
    }

    #[tokio::test]
    async fn test_fn_executor_maps_results() {
        let ok = FnExecutor::new(|ctx: TaskCtx| async move {
            let score: u32 = ctx.output::<Value>("risk")?["score"]
                .as_u64()
                .unwrap_or_default() as u32;
            Ok(TaskOutput::new(json!({"days": score * 2}))
                .with_metrics(MetricsDelta::tokens(10)))
        });
        let result = ok.execute(&ctx()).await;
        assert_eq!(
            result,
            ExecutionResult::success_with_metrics(json!({"days": 14}), MetricsDelta::tokens(10))
        );

        let failing = FnExecutor::new(|_ctx| async { Err(anyhow::anyhow!("upstream 503")) });
        match failing.execute(&ctx()).await {
            ExecutionResult::Failure { kind, reason } => {
                assert_eq!(kind, ErrorKind::TaskExecution);
                assert_eq!(reason, "upstream 503");
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
