//! The crisis-plan task table
//!
//! Six generation tasks cooperate on one plan. Risk assessment, resource lookup
//! and video curation start immediately; supply planning and the financial plan
//! wait for the risk assessment; the final document waits for everything else.
//! The financial plan only exists for economic crises.
//!
//! Task bodies are supplied by the caller as executors keyed by task id.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::coord::executor::TaskExecutor;
use crate::coord::registry::{Precondition, TaskDescriptor, TaskRegistry};
use crate::coord::types::{Seed, Variant};
use crate::core::errors::{BoardError, Result};

pub const RISK_ASSESSMENT: &str = "risk_assessment";
pub const SUPPLY_PLANNING: &str = "supply_planning";
pub const RESOURCE_LOCATOR: &str = "resource_locator";
pub const VIDEO_CURATOR: &str = "video_curator";
pub const FINANCIAL_ADVISOR: &str = "financial_advisor";
pub const DOCUMENTATION: &str = "documentation";

/// Every task id in registration order
pub const ALL_TASKS: [&str; 6] = [
    RISK_ASSESSMENT,
    SUPPLY_PLANNING,
    RESOURCE_LOCATOR,
    VIDEO_CURATOR,
    FINANCIAL_ADVISOR,
    DOCUMENTATION,
];

const MAX_HOUSEHOLD: u64 = 20;

pub fn descriptors() -> Vec<TaskDescriptor> {
    vec![
        TaskDescriptor::new(RISK_ASSESSMENT).describe("Assess threat severity and timeline"),
        TaskDescriptor::new(SUPPLY_PLANNING)
            .describe("Budget-constrained supply list")
            .needs([RISK_ASSESSMENT]),
        TaskDescriptor::new(RESOURCE_LOCATOR).describe("Nearby shelters and services"),
        TaskDescriptor::new(VIDEO_CURATOR).describe("Preparedness videos"),
        TaskDescriptor::new(FINANCIAL_ADVISOR)
            .describe("Cash-flow and benefits plan")
            .applies_to_variants([Variant::EconomicCrisis])
            .needs([RISK_ASSESSMENT]),
        TaskDescriptor::new(DOCUMENTATION)
            .describe("Assemble the final plan document")
            .requires(Precondition::AllOf(vec![
                Precondition::completed([
                    RISK_ASSESSMENT,
                    SUPPLY_PLANNING,
                    RESOURCE_LOCATOR,
                    VIDEO_CURATOR,
                ]),
                Precondition::for_variant(
                    Variant::EconomicCrisis,
                    Precondition::completed([FINANCIAL_ADVISOR]),
                ),
            ])),
    ]
}

/// Build the crisis-plan registry from one executor per task id.
///
/// Missing executors and executors for unknown ids are configuration errors.
pub fn build_registry(
    mut executors: HashMap<String, Arc<dyn TaskExecutor>>,
) -> Result<TaskRegistry> {
    let mut builder = TaskRegistry::builder();
    for descriptor in descriptors() {
        let executor = executors.remove(descriptor.id()).ok_or_else(|| {
            BoardError::configuration_field(
                format!("no executor supplied for {}", descriptor.id()),
                "executors",
            )
        })?;
        builder = builder.register(descriptor, executor);
    }
    if let Some(unknown) = executors.keys().next() {
        return Err(BoardError::configuration_field(
            format!("executor supplied for unknown task {}", unknown),
            "executors",
        ));
    }
    builder.build()
}

/// JSON schema for the crisis profile carried in the seed payload
pub fn crisis_profile_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "task_id": {"type": "string", "minLength": 1},
            "crisis_mode": {"enum": ["natural_disaster", "economic_crisis"]},
            "specific_threat": {"type": "string", "minLength": 1},
            "location": {
                "type": "object",
                "properties": {
                    "city": {"type": "string"},
                    "state": {"type": "string"},
                    "zip_code": {"type": ["string", "null"]},
                    "country": {"type": "string"},
                    "latitude": {"type": ["number", "null"]},
                    "longitude": {"type": ["number", "null"]}
                },
                "required": ["city", "state"]
            },
            "household": {
                "type": "object",
                "properties": {
                    "adults": {"type": "integer", "minimum": 1, "maximum": 20},
                    "children": {"type": "integer", "minimum": 0, "maximum": 20},
                    "pets": {"type": "integer", "minimum": 0, "maximum": 10},
                    "special_needs": {"type": ["string", "null"]}
                },
                "required": ["adults"]
            },
            "housing_type": {"enum": ["apartment", "house", "mobile_home", "other"]},
            "budget_tier": {"enum": [50, 100, 200]},
            "financial_situation": {"type": ["object", "null"]}
        },
        "required": [
            "task_id",
            "crisis_mode",
            "specific_threat",
            "location",
            "household",
            "housing_type",
            "budget_tier"
        ]
    })
}

/// Check a crisis profile against the schema and the household size limit
pub fn validate_crisis_profile(profile: &Value) -> Result<()> {
    let schema = crisis_profile_schema();
    let validator = jsonschema::validator_for(&schema)
        .map_err(|e| BoardError::internal(format!("Failed to compile profile schema: {}", e)))?;

    let errors: Vec<String> = validator
        .iter_errors(profile)
        .map(|e| format!("{} at '{}'", e, e.instance_path))
        .collect();
    if !errors.is_empty() {
        tracing::warn!("Crisis profile validation failed: {}", errors.join("; "));
        return Err(BoardError::validation(format!(
            "Invalid crisis profile: {}",
            errors.join("; ")
        )));
    }

    let household = &profile["household"];
    let size = household["adults"].as_u64().unwrap_or(0)
        + household["children"].as_u64().unwrap_or(0);
    if size > MAX_HOUSEHOLD {
        return Err(BoardError::validation_field(
            format!("Household size cannot exceed {} people", MAX_HOUSEHOLD),
            "household",
        ));
    }
    Ok(())
}

/// Validate a crisis profile and turn it into a run seed
pub fn seed_from_profile(profile: Value) -> Result<Seed> {
    validate_crisis_profile(&profile)?;
    Seed::from_value(profile)
}
