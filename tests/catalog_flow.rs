//! Full crisis-plan runs over the six-task catalog with a sled checkpoint store

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use planboard::catalog::{self, ALL_TASKS, DOCUMENTATION, FINANCIAL_ADVISOR, SUPPLY_PLANNING};
use planboard::{
    Coordinator, CoordinatorConfig, FnExecutor, MetricsDelta, RunDiagnostic, RunStatus,
    SledStore, StateStore, StatusFilter, TaskCtx, TaskExecutor, TaskOutput,
};

fn profile(task_id: &str, mode: &str) -> Value {
    json!({
        "task_id": task_id,
        "crisis_mode": mode,
        "specific_threat": if mode == "economic_crisis" { "layoff" } else { "hurricane" },
        "location": {"city": "Miami Beach", "state": "FL", "country": "US"},
        "household": {"adults": 2, "children": 1, "pets": 0},
        "housing_type": "apartment",
        "budget_tier": 100,
        "financial_situation": if mode == "economic_crisis" {
            json!({"current_income": 0, "monthly_expenses": 3200})
        } else {
            Value::Null
        }
    })
}

/// Executor that writes a section naming the sections it could read
fn section() -> Arc<dyn TaskExecutor> {
    Arc::new(FnExecutor::new(|ctx: TaskCtx| async move {
        let threat: String = ctx.payload("specific_threat")?;
        let read: Vec<String> = ctx.snapshot.outputs().keys().cloned().collect();
        Ok(TaskOutput::new(json!({
            "section": ctx.task_id,
            "threat": threat,
            "read": read,
        }))
        .with_metrics(MetricsDelta::tokens(100).with_cost(0.01)))
    }))
}

fn executors() -> HashMap<String, Arc<dyn TaskExecutor>> {
    ALL_TASKS
        .iter()
        .map(|id| (id.to_string(), section()))
        .collect()
}

fn coordinator(
    executors: HashMap<String, Arc<dyn TaskExecutor>>,
    store: Arc<SledStore>,
) -> Coordinator {
    let registry = catalog::build_registry(executors).unwrap();
    Coordinator::new(registry, store, CoordinatorConfig::development()).unwrap()
}

#[tokio::test]
async fn test_natural_disaster_plan() {
    let store = Arc::new(SledStore::temporary().unwrap());
    let coordinator = coordinator(executors(), store.clone());
    let seed = catalog::seed_from_profile(profile("nd-1", "natural_disaster")).unwrap();

    let state = coordinator.run(seed).await.unwrap();

    assert_eq!(state.status(), RunStatus::Completed);
    assert_eq!(state.completed().len(), 5);
    assert!(!state.completed().contains(FINANCIAL_ADVISOR));
    // risk/resources/videos, then supplies, then the document
    assert_eq!(state.iteration(), 3);
    assert_eq!(state.metrics().tokens_used, 500);

    let document = state.output(DOCUMENTATION).unwrap();
    assert_eq!(document["read"].as_array().unwrap().len(), 4);
    assert_eq!(document["threat"], "hurricane");

    let stored = store.get("nd-1").await.unwrap().unwrap();
    assert_eq!(stored.status(), RunStatus::Completed);
    assert_eq!(stored.outputs(), state.outputs());
    assert_eq!(stored.metrics().tokens_used, 500);
}

#[tokio::test]
async fn test_economic_crisis_plan_waits_for_financial_section() {
    let store = Arc::new(SledStore::temporary().unwrap());
    let coordinator = coordinator(executors(), store.clone());
    let seed = catalog::seed_from_profile(profile("ec-1", "economic_crisis")).unwrap();

    let state = coordinator.run(seed).await.unwrap();

    assert_eq!(state.status(), RunStatus::Completed);
    assert_eq!(state.completed().len(), 6);
    let document = state.output(DOCUMENTATION).unwrap();
    let read: Vec<&str> = document["read"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert!(read.contains(&FINANCIAL_ADVISOR));
    assert_eq!(read.len(), 5);
}

#[tokio::test]
async fn test_failed_supply_plan_blocks_document() {
    let mut executors = executors();
    executors.insert(
        SUPPLY_PLANNING.to_string(),
        Arc::new(FnExecutor::new(|_ctx| async {
            Err(anyhow::anyhow!("rate limited"))
        })),
    );
    let store = Arc::new(SledStore::temporary().unwrap());
    let coordinator = coordinator(executors, store.clone());
    let seed = catalog::seed_from_profile(profile("nd-2", "natural_disaster")).unwrap();

    let state = coordinator.run(seed).await.unwrap();

    assert_eq!(state.status(), RunStatus::Failed);
    assert!(state.failed().contains(SUPPLY_PLANNING));
    match state.diagnostic() {
        Some(RunDiagnostic::Deadlock { pending, cycles }) => {
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].task_id, DOCUMENTATION);
            assert_eq!(pending[0].unmet, "completed: supply_planning");
            assert!(cycles.is_empty());
        }
        other => panic!("expected deadlock, got {:?}", other),
    }

    let failed = store
        .list(StatusFilter::Only(RunStatus::Failed), 10)
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].run_id(), "nd-2");
}

#[tokio::test]
async fn test_invalid_profile_never_starts() {
    let mut bad = profile("bad-1", "natural_disaster");
    bad["household"]["adults"] = json!(0);
    assert!(catalog::seed_from_profile(bad).is_err());
}
