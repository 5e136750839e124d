//! Generate a crisis plan with stub section writers
//!
//! Usage: `cargo run --example crisis_plan [economic] [config.yaml]`

use anyhow::Result;
use planboard::catalog::{self, ALL_TASKS, DOCUMENTATION};
use planboard::{
    Coordinator, CoordinatorConfig, FnExecutor, LoggingObserver, MemoryStore, MetricsDelta,
    TaskCtx, TaskExecutor, TaskOutput,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Stands in for the model client a real deployment would share with every task
struct PlanSettings {
    model: &'static str,
}

fn stub_writer(latency_ms: u64) -> Arc<dyn TaskExecutor> {
    Arc::new(FnExecutor::new(move |ctx: TaskCtx| async move {
        tokio::time::sleep(Duration::from_millis(latency_ms)).await;
        let model = ctx.app_data::<PlanSettings>().map(|s| s.model).unwrap_or("none");
        let threat: String = ctx.payload("specific_threat")?;
        Ok(TaskOutput::new(json!({
            "title": format!("{} for {}", ctx.task_id, threat),
            "model": model,
            "inputs": ctx.snapshot.outputs().keys().collect::<Vec<_>>(),
        }))
        .with_metrics(MetricsDelta::tokens(250 + latency_ms)))
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let economic = args.iter().any(|a| a == "economic");
    let config = match args.iter().find(|a| a.ends_with(".yaml") || a.ends_with(".yml")) {
        Some(path) => CoordinatorConfig::from_yaml_file(path)?,
        None => CoordinatorConfig::development(),
    };

    let executors: HashMap<String, Arc<dyn TaskExecutor>> = ALL_TASKS
        .iter()
        .enumerate()
        .map(|(i, id)| (id.to_string(), stub_writer(50 * (i as u64 + 1))))
        .collect();
    let registry = catalog::build_registry(executors)?;

    let profile = json!({
        "task_id": uuid::Uuid::new_v4().to_string(),
        "crisis_mode": if economic { "economic_crisis" } else { "natural_disaster" },
        "specific_threat": if economic { "layoff" } else { "hurricane" },
        "location": {"city": "Miami Beach", "state": "FL", "zip_code": "33139"},
        "household": {"adults": 2, "children": 1, "pets": 1},
        "housing_type": "apartment",
        "budget_tier": 100
    });
    let seed = catalog::seed_from_profile(profile)?;

    let coordinator = Coordinator::new(registry, Arc::new(MemoryStore::new()), config)?
        .with_observer(Arc::new(LoggingObserver))
        .with_app_data(Arc::new(PlanSettings { model: "stub-writer" }));

    let state = coordinator.run(seed).await?;

    println!("Run {} finished: {}", state.run_id(), state.status());
    println!(
        "  supersteps: {}, tokens: {}, seconds: {:.2}",
        state.iteration(),
        state.metrics().tokens_used,
        state.total_execution_seconds().unwrap_or_default()
    );
    if let Some(diag) = state.diagnostic() {
        println!("  diagnostic: {}", diag);
    }
    if let Some(document) = state.output(DOCUMENTATION) {
        println!("{}", serde_json::to_string_pretty(document)?);
    }
    Ok(())
}
