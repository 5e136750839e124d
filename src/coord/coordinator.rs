//! Coordinator - drives a run through bulk-synchronous supersteps
//!
//! Each superstep computes the ready set from the current board, runs every
//! ready task concurrently against the same snapshot, waits for all of them,
//! and merges the whole batch at once. The coordinator is the only writer of
//! the [`SharedState`]; executors and observers only ever see immutable views.

use futures::future::join_all;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinError;

use crate::coord::executor::TaskCtx;
use crate::coord::hooks::RunObserver;
use crate::coord::registry::TaskRegistry;
use crate::coord::state::{SharedState, StateSnapshot};
use crate::coord::types::{ExecutionResult, RunDiagnostic, RunStatus, Seed, TaskId};
use crate::core::config::CoordinatorConfig;
use crate::core::errors::{BoardError, Result};
use crate::storage::StateStore;

/// Superstep scheduler for one registry, reusable across runs
pub struct Coordinator {
    registry: TaskRegistry,
    store: Arc<dyn StateStore>,
    config: CoordinatorConfig,
    observers: Vec<Arc<dyn RunObserver>>,
    app_data: Option<Arc<dyn Any + Send + Sync>>,
}

impl Coordinator {
    /// Create a coordinator; the configuration is validated here
    pub fn new(
        registry: TaskRegistry,
        store: Arc<dyn StateStore>,
        config: CoordinatorConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            registry,
            store,
            config,
            observers: Vec::new(),
            app_data: None,
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Application context handed to every executor through `TaskCtx::app_data`
    pub fn with_app_data(mut self, data: Arc<dyn Any + Send + Sync>) -> Self {
        self.app_data = Some(data);
        self
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Run a seed to a terminal state.
    ///
    /// Seed validation and a run id already present in the store are reported
    /// as `Err`; an existing run is resumed with [`Coordinator::run_stored`].
    /// Every run that starts ends in `Ok` with a `completed` or `failed` state;
    /// a failed state carries a [`RunDiagnostic`].
    pub async fn run(&self, seed: Seed) -> Result<SharedState> {
        let state = SharedState::init(seed)?;
        match self.store.create(&state).await {
            Ok(()) => {}
            Err(e @ BoardError::RunAlreadyExists { .. }) => return Err(e),
            Err(e) => {
                tracing::warn!(run_id = %state.run_id(), error = %e, "Failed to create run checkpoint");
            }
        }
        Ok(self.drive(state).await)
    }

    /// Run a state previously created in the store, e.g. via `create_from_seed`
    pub async fn run_stored(&self, run_id: &str) -> Result<SharedState> {
        let state = self
            .store
            .get(run_id)
            .await?
            .ok_or_else(|| BoardError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        if state.is_terminal() {
            return Err(BoardError::Archived {
                run_id: run_id.to_string(),
                status: state.status().to_string(),
            });
        }
        Ok(self.drive(state).await)
    }

    async fn drive(&self, mut state: SharedState) -> SharedState {
        state.mark_running();
        self.checkpoint(&state).await;
        for observer in &self.observers {
            observer.on_start(&state).await;
        }

        let required = self.registry.required_ids(state.seed());
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_tasks));
        tracing::info!(
            run_id = %state.run_id(),
            variant = %state.variant(),
            required = required.len(),
            "Starting superstep loop"
        );

        loop {
            if required.iter().all(|id| state.completed().contains(id)) {
                self.conclude(&mut state, RunStatus::Completed, None);
                break;
            }

            let snapshot = state.snapshot();
            let ready = self.registry.ready_in(&state, &snapshot);

            if ready.is_empty() {
                let pending = state.pending_task_ids(&self.registry);
                let diagnostic = if pending.is_empty() {
                    RunDiagnostic::RequiredTaskFailed {
                        failed: required
                            .iter()
                            .filter(|id| !state.completed().contains(*id))
                            .cloned()
                            .collect(),
                    }
                } else {
                    RunDiagnostic::Deadlock {
                        pending: self.registry.unmet_preconditions(&state),
                        cycles: self.registry.dependency_cycles(&pending, state.variant()),
                    }
                };
                self.conclude(&mut state, RunStatus::Failed, Some(diagnostic));
                break;
            }

            if state.iteration() >= self.config.max_iterations {
                let diagnostic = RunDiagnostic::IterationCapExceeded {
                    iterations: state.iteration(),
                    pending: state.pending_task_ids(&self.registry),
                };
                self.conclude(&mut state, RunStatus::Failed, Some(diagnostic));
                break;
            }

            tracing::info!(
                run_id = %state.run_id(),
                iteration = state.iteration(),
                "Dispatching {} ready tasks: {:?}",
                ready.len(),
                ready
            );
            for observer in &self.observers {
                observer.on_dispatch(state.run_id(), state.iteration(), &ready).await;
            }

            let batch = self.dispatch(&ready, &snapshot, &semaphore).await;
            for (task_id, result) in &batch {
                for observer in &self.observers {
                    observer.on_task_finished(state.run_id(), task_id, result).await;
                }
            }

            if let Err(e) = state.merge(batch) {
                tracing::error!(run_id = %state.run_id(), error = %e, "Rejected superstep batch");
                let diagnostic = RunDiagnostic::Conflict {
                    message: e.to_string(),
                };
                self.conclude(&mut state, RunStatus::Failed, Some(diagnostic));
                break;
            }
            state.advance_iteration();

            if self.config.checkpoint_enabled {
                self.checkpoint(&state).await;
            }
            for observer in &self.observers {
                observer.on_superstep(&state).await;
            }

            if !self.config.superstep_delay.is_zero() {
                tokio::time::sleep(self.config.superstep_delay).await;
            }
        }

        self.checkpoint(&state).await;
        for observer in &self.observers {
            observer.on_complete(&state).await;
        }
        state
    }

    /// Run every ready task against the same snapshot and collect all results
    async fn dispatch(
        &self,
        ready: &[TaskId],
        snapshot: &StateSnapshot,
        semaphore: &Arc<Semaphore>,
    ) -> Vec<(TaskId, ExecutionResult)> {
        let handles: Vec<_> = ready
            .iter()
            .map(|task_id| {
                let timeout = self
                    .registry
                    .descriptor(task_id)
                    .and_then(|d| d.timeout())
                    .unwrap_or(self.config.task_timeout);
                let mut ctx = TaskCtx::new(task_id.clone(), snapshot.clone(), timeout);
                if let Some(data) = &self.app_data {
                    ctx = ctx.with_app_data(data.clone());
                }
                let executor = self.registry.executor(task_id);
                let semaphore = semaphore.clone();

                tokio::spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return ExecutionResult::failure("concurrency limiter closed");
                    };
                    let Some(executor) = executor else {
                        return ExecutionResult::failure(format!(
                            "no executor registered for {}",
                            ctx.task_id
                        ));
                    };
                    execute_with_timeout(executor.as_ref(), &ctx, timeout).await
                })
            })
            .collect();

        let joined = join_all(handles).await;
        ready
            .iter()
            .cloned()
            .zip(joined)
            .map(|(task_id, joined)| {
                let result = joined.unwrap_or_else(|e| panic_failure(&task_id, e));
                (task_id, result)
            })
            .collect()
    }

    async fn checkpoint(&self, state: &SharedState) {
        if let Err(e) = self.store.update(state).await {
            tracing::warn!(
                run_id = %state.run_id(),
                iteration = state.iteration(),
                error = %e,
                "Checkpoint failed, continuing run"
            );
        }
    }

    fn conclude(
        &self,
        state: &mut SharedState,
        status: RunStatus,
        diagnostic: Option<RunDiagnostic>,
    ) {
        if let Err(e) = state.finish(status, diagnostic) {
            tracing::error!(run_id = %state.run_id(), error = %e, "Failed to finish run");
            return;
        }

        let elapsed = state.total_execution_seconds().unwrap_or_default();
        match state.diagnostic() {
            Some(diag) => tracing::error!(
                run_id = %state.run_id(),
                iterations = state.iteration(),
                completed = state.completed().len(),
                failed = state.failed().len(),
                elapsed_secs = elapsed,
                "Run failed: {}",
                diag
            ),
            None => tracing::info!(
                run_id = %state.run_id(),
                iterations = state.iteration(),
                completed = state.completed().len(),
                failed = state.failed().len(),
                tokens = state.metrics().tokens_used,
                elapsed_secs = elapsed,
                "Run completed"
            ),
        }
    }
}

async fn execute_with_timeout(
    executor: &dyn crate::coord::executor::TaskExecutor,
    ctx: &TaskCtx,
    timeout: Duration,
) -> ExecutionResult {
    match tokio::time::timeout(timeout, executor.execute(ctx)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(run_id = %ctx.run_id, task_id = %ctx.task_id, "Task timed out after {:?}", timeout);
            ExecutionResult::timed_out(&ctx.task_id, timeout)
        }
    }
}

fn panic_failure(task_id: &str, err: JoinError) -> ExecutionResult {
    let detail = if err.is_panic() {
        let payload = err.into_panic();
        payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string())
    } else {
        err.to_string()
    };
    tracing::error!(task_id, "Executor panicked: {}", detail);
    ExecutionResult::failure(format!("executor panicked: {}", detail))
}
