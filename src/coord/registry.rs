//! Task registry: the static table of task descriptors and their executors
//!
//! Built once through [`TaskRegistryBuilder`] and frozen afterwards. Readiness is
//! evaluated from declarative [`Precondition`]s so that a stalled run can explain
//! exactly what each pending task is still waiting for.

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::coord::executor::TaskExecutor;
use crate::coord::state::{SharedState, StateSnapshot};
use crate::coord::types::{PendingTask, Seed, TaskId, Variant};
use crate::core::errors::{BoardError, Result};

type SnapshotPredicate = Arc<dyn Fn(&StateSnapshot) -> bool + Send + Sync>;
type SeedPredicate = Arc<dyn Fn(&Seed) -> bool + Send + Sync>;

/// Condition on the blackboard that must hold before a task may run.
///
/// Preconditions only look at outputs and completed ids, never at failures.
#[derive(Clone)]
pub enum Precondition {
    Always,
    /// Every listed task has completed successfully
    Completed(Vec<TaskId>),
    /// An output with this key is on the board
    OutputPresent(String),
    AllOf(Vec<Precondition>),
    /// `inner` applies only to runs of `variant`; other variants treat it as met
    ForVariant {
        variant: Variant,
        inner: Box<Precondition>,
    },
    Custom {
        description: String,
        predicate: SnapshotPredicate,
    },
}

impl Precondition {
    pub fn completed<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        Precondition::Completed(ids.into_iter().map(Into::into).collect())
    }

    pub fn output(key: impl Into<String>) -> Self {
        Precondition::OutputPresent(key.into())
    }

    pub fn for_variant(variant: Variant, inner: Precondition) -> Self {
        Precondition::ForVariant {
            variant,
            inner: Box::new(inner),
        }
    }

    pub fn custom<F>(description: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&StateSnapshot) -> bool + Send + Sync + 'static,
    {
        Precondition::Custom {
            description: description.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn is_satisfied(&self, snapshot: &StateSnapshot) -> bool {
        self.unmet(snapshot).is_none()
    }

    /// Describe the part of this precondition that does not hold yet
    pub fn unmet(&self, snapshot: &StateSnapshot) -> Option<String> {
        match self {
            Precondition::Always => None,
            Precondition::Completed(ids) => {
                let missing: Vec<&str> = ids
                    .iter()
                    .filter(|id| !snapshot.is_completed(id))
                    .map(String::as_str)
                    .collect();
                if missing.is_empty() {
                    None
                } else {
                    Some(format!("completed: {}", missing.join(", ")))
                }
            }
            Precondition::OutputPresent(key) => {
                if snapshot.has_output(key) {
                    None
                } else {
                    Some(format!("output: {}", key))
                }
            }
            Precondition::AllOf(all) => {
                let parts: Vec<String> = all.iter().filter_map(|p| p.unmet(snapshot)).collect();
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.join(" and "))
                }
            }
            Precondition::ForVariant { variant, inner } => {
                if snapshot.variant() == *variant {
                    inner.unmet(snapshot)
                } else {
                    None
                }
            }
            Precondition::Custom {
                description,
                predicate,
            } => {
                if predicate(snapshot) {
                    None
                } else {
                    Some(description.clone())
                }
            }
        }
    }

    /// Task ids this precondition waits on, for cycle detection.
    ///
    /// Output keys are treated as the id of the task that writes them.
    pub fn dependencies(&self, variant: Variant) -> Vec<TaskId> {
        let mut deps = Vec::new();
        self.collect_dependencies(variant, &mut deps);
        deps
    }

    fn collect_dependencies(&self, variant: Variant, deps: &mut Vec<TaskId>) {
        match self {
            Precondition::Always | Precondition::Custom { .. } => {}
            Precondition::Completed(ids) => deps.extend(ids.iter().cloned()),
            Precondition::OutputPresent(key) => deps.push(key.clone()),
            Precondition::AllOf(all) => {
                for p in all {
                    p.collect_dependencies(variant, deps);
                }
            }
            Precondition::ForVariant { variant: only, inner } => {
                if *only == variant {
                    inner.collect_dependencies(variant, deps);
                }
            }
        }
    }

    fn all_dependencies(&self, deps: &mut Vec<TaskId>) {
        match self {
            Precondition::ForVariant { inner, .. } => inner.all_dependencies(deps),
            Precondition::AllOf(all) => all.iter().for_each(|p| p.all_dependencies(deps)),
            Precondition::Completed(ids) => deps.extend(ids.iter().cloned()),
            Precondition::OutputPresent(key) => deps.push(key.clone()),
            Precondition::Always | Precondition::Custom { .. } => {}
        }
    }
}

impl fmt::Display for Precondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precondition::Always => f.write_str("always"),
            Precondition::Completed(ids) => write!(f, "completed: {}", ids.join(", ")),
            Precondition::OutputPresent(key) => write!(f, "output: {}", key),
            Precondition::AllOf(all) => {
                for (i, p) in all.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" and ")?;
                    }
                    write!(f, "{}", p)?;
                }
                Ok(())
            }
            Precondition::ForVariant { variant, inner } => {
                write!(f, "{} (when {})", inner, variant)
            }
            Precondition::Custom { description, .. } => f.write_str(description),
        }
    }
}

impl fmt::Debug for Precondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Precondition({})", self)
    }
}

/// Predicate over the run seed, used for applicability and success requirements
#[derive(Clone)]
pub enum SeedRule {
    Always,
    Never,
    Variants(Vec<Variant>),
    Custom {
        description: String,
        predicate: SeedPredicate,
    },
}

impl SeedRule {
    pub fn custom<F>(description: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Seed) -> bool + Send + Sync + 'static,
    {
        SeedRule::Custom {
            description: description.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn matches(&self, seed: &Seed) -> bool {
        match self {
            SeedRule::Always => true,
            SeedRule::Never => false,
            SeedRule::Variants(variants) => variants.contains(&seed.variant),
            SeedRule::Custom { predicate, .. } => predicate(seed),
        }
    }
}

impl fmt::Debug for SeedRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeedRule::Always => f.write_str("Always"),
            SeedRule::Never => f.write_str("Never"),
            SeedRule::Variants(v) => f.debug_tuple("Variants").field(v).finish(),
            SeedRule::Custom { description, .. } => write!(f, "Custom({})", description),
        }
    }
}

/// Static description of one task
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    id: TaskId,
    description: String,
    applies_to: SeedRule,
    precondition: Precondition,
    required: SeedRule,
    timeout: Option<Duration>,
}

impl TaskDescriptor {
    /// A task that always applies, is always ready, and is required for success
    pub fn new(id: impl Into<TaskId>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            applies_to: SeedRule::Always,
            precondition: Precondition::Always,
            required: SeedRule::Always,
            timeout: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Restrict the task to runs of the given variants
    pub fn applies_to_variants(mut self, variants: impl IntoIterator<Item = Variant>) -> Self {
        self.applies_to = SeedRule::Variants(variants.into_iter().collect());
        self
    }

    pub fn applies_when(mut self, rule: SeedRule) -> Self {
        self.applies_to = rule;
        self
    }

    /// Wait for the listed tasks to complete
    pub fn needs<I, S>(self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.requires(Precondition::completed(ids))
    }

    pub fn requires(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }

    /// The run may complete without this task
    pub fn optional(mut self) -> Self {
        self.required = SeedRule::Never;
        self
    }

    pub fn required_when(mut self, rule: SeedRule) -> Self {
        self.required = rule;
        self
    }

    /// Override the coordinator's default timeout for this task
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn precondition(&self) -> &Precondition {
        &self.precondition
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn applies_to(&self, seed: &Seed) -> bool {
        self.applies_to.matches(seed)
    }

    pub fn is_ready(&self, snapshot: &StateSnapshot) -> bool {
        self.precondition.is_satisfied(snapshot)
    }

    /// Required only where it also applies
    pub fn required_for_success(&self, seed: &Seed) -> bool {
        self.applies_to(seed) && self.required.matches(seed)
    }
}

struct RegisteredTask {
    descriptor: TaskDescriptor,
    executor: Arc<dyn TaskExecutor>,
}

/// Frozen table of tasks, cheap to clone and share across runs
#[derive(Clone)]
pub struct TaskRegistry {
    tasks: Arc<Vec<RegisteredTask>>,
    index: Arc<HashMap<TaskId, usize>>,
}

impl TaskRegistry {
    pub fn builder() -> TaskRegistryBuilder {
        TaskRegistryBuilder::new()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// All task ids in registration order
    pub fn ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|t| t.descriptor.id.clone()).collect()
    }

    pub fn descriptor(&self, id: &str) -> Option<&TaskDescriptor> {
        self.index.get(id).map(|&i| &self.tasks[i].descriptor)
    }

    pub fn executor(&self, id: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.index.get(id).map(|&i| self.tasks[i].executor.clone())
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &TaskDescriptor> {
        self.tasks.iter().map(|t| &t.descriptor)
    }

    /// Ids of tasks that apply to this seed
    pub fn applicable_ids(&self, seed: &Seed) -> Vec<TaskId> {
        self.descriptors()
            .filter(|d| d.applies_to(seed))
            .map(|d| d.id.clone())
            .collect()
    }

    /// Ids that must complete for a run of this seed to succeed
    pub fn required_ids(&self, seed: &Seed) -> Vec<TaskId> {
        self.descriptors()
            .filter(|d| d.required_for_success(seed))
            .map(|d| d.id.clone())
            .collect()
    }

    /// Applicable, unfinished tasks whose preconditions hold, in registration order
    pub fn ready_set(&self, state: &SharedState) -> Vec<TaskId> {
        self.ready_in(state, &state.snapshot())
    }

    pub(crate) fn ready_in(&self, state: &SharedState, snapshot: &StateSnapshot) -> Vec<TaskId> {
        self.descriptors()
            .filter(|d| d.applies_to(state.seed()))
            .filter(|d| !state.is_finished(&d.id))
            .filter(|d| d.is_ready(snapshot))
            .map(|d| d.id.clone())
            .collect()
    }

    /// Each pending task paired with the part of its precondition that does not hold
    pub fn unmet_preconditions(&self, state: &SharedState) -> Vec<PendingTask> {
        let snapshot = state.snapshot();
        state
            .pending_task_ids(self)
            .into_iter()
            .filter_map(|id| {
                let descriptor = self.descriptor(&id)?;
                let unmet = descriptor
                    .precondition
                    .unmet(&snapshot)
                    .unwrap_or_else(|| "ready".to_string());
                Some(PendingTask { task_id: id, unmet })
            })
            .collect()
    }

    /// Groups of the given tasks whose preconditions wait on one another.
    ///
    /// Each group is listed in registration order; groups are ordered by their
    /// first member.
    pub fn dependency_cycles(&self, ids: &[TaskId], variant: Variant) -> Vec<Vec<TaskId>> {
        let members: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();
        for id in ids {
            nodes.insert(id.as_str(), graph.add_node(id.as_str()));
        }

        let mut self_loops = HashSet::new();
        for id in ids {
            let Some(descriptor) = self.descriptor(id) else {
                continue;
            };
            for dep in descriptor.precondition.dependencies(variant) {
                if !members.contains(dep.as_str()) {
                    continue;
                }
                if dep == *id {
                    self_loops.insert(id.as_str());
                }
                graph.add_edge(nodes[dep.as_str()], nodes[id.as_str()], ());
            }
        }

        let order = |id: &str| self.index.get(id).copied().unwrap_or(usize::MAX);
        let mut cycles: Vec<Vec<TaskId>> = tarjan_scc(&graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || self_loops.contains(graph[scc[0]]))
            .map(|scc| {
                let mut group: Vec<TaskId> =
                    scc.into_iter().map(|n| graph[n].to_string()).collect();
                group.sort_by_key(|id| order(id));
                group
            })
            .collect();
        cycles.sort_by_key(|group| order(&group[0]));
        cycles
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.ids())
            .finish()
    }
}

/// Collects descriptors and executors, then freezes them into a [`TaskRegistry`]
#[derive(Default)]
pub struct TaskRegistryBuilder {
    tasks: Vec<RegisteredTask>,
}

impl TaskRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, descriptor: TaskDescriptor, executor: Arc<dyn TaskExecutor>) -> Self {
        self.tasks.push(RegisteredTask {
            descriptor,
            executor,
        });
        self
    }

    /// Validate and freeze the registry.
    ///
    /// Rejects empty or duplicate ids and preconditions naming unknown tasks.
    /// Static cycles are allowed but logged, since they stall any run reaching them.
    pub fn build(self) -> Result<TaskRegistry> {
        let mut index = HashMap::with_capacity(self.tasks.len());
        for (i, task) in self.tasks.iter().enumerate() {
            let id = &task.descriptor.id;
            if id.trim().is_empty() {
                return Err(BoardError::configuration_field("task id cannot be empty", "id"));
            }
            if index.insert(id.clone(), i).is_some() {
                return Err(BoardError::configuration_field(
                    format!("task {} registered twice", id),
                    "id",
                ));
            }
        }

        for task in self.tasks.iter() {
            let mut deps = Vec::new();
            task.descriptor.precondition.all_dependencies(&mut deps);
            if let Some(unknown) = deps.iter().find(|d| !index.contains_key(*d)) {
                return Err(BoardError::configuration_field(
                    format!(
                        "task {} depends on unknown task {}",
                        task.descriptor.id, unknown
                    ),
                    "precondition",
                ));
            }
        }

        let registry = TaskRegistry {
            tasks: Arc::new(self.tasks),
            index: Arc::new(index),
        };

        let ids = registry.ids();
        for variant in [Variant::NaturalDisaster, Variant::EconomicCrisis] {
            for cycle in registry.dependency_cycles(&ids, variant) {
                tracing::warn!(
                    variant = %variant,
                    "Registry contains a dependency cycle: {}",
                    cycle.join(" -> ")
                );
            }
        }

        tracing::debug!("Built task registry with {} tasks", registry.len());
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::executor::{FnExecutor, TaskOutput};
    use crate::coord::types::ExecutionResult;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn noop() -> Arc<dyn TaskExecutor> {
        Arc::new(FnExecutor::new(|_ctx| async { Ok(TaskOutput::new(json!(null))) }))
    }

    fn seed(variant: Variant) -> Seed {
        Seed::with_run_id("run", variant)
    }

    fn registry() -> TaskRegistry {
        TaskRegistry::builder()
            .register(TaskDescriptor::new("r"), noop())
            .register(TaskDescriptor::new("s").needs(["r"]), noop())
            .register(
                TaskDescriptor::new("f")
                    .applies_to_variants([Variant::EconomicCrisis])
                    .needs(["r"]),
                noop(),
            )
            .register(
                TaskDescriptor::new("v").optional().with_timeout(Duration::from_secs(5)),
                noop(),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_ready_set_follows_preconditions() {
        let registry = registry();
        let mut state = SharedState::init(seed(Variant::NaturalDisaster)).unwrap();

        assert_eq!(registry.ready_set(&state), vec!["r", "v"]);

        state
            .merge(vec![("r".to_string(), ExecutionResult::success(json!({})))])
            .unwrap();
        assert_eq!(registry.ready_set(&state), vec!["s", "v"]);
        assert_eq!(state.pending_task_ids(&registry), vec!["s", "v"]);
    }

    #[test]
    fn test_variant_applicability_and_requirements() {
        let registry = registry();
        let natural = seed(Variant::NaturalDisaster);
        let economic = seed(Variant::EconomicCrisis);

        assert_eq!(registry.applicable_ids(&natural), vec!["r", "s", "v"]);
        assert_eq!(registry.applicable_ids(&economic), vec!["r", "s", "f", "v"]);
        assert_eq!(registry.required_ids(&natural), vec!["r", "s"]);
        assert_eq!(registry.required_ids(&economic), vec!["r", "s", "f"]);
        assert_eq!(
            registry.descriptor("v").unwrap().timeout(),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_unmet_preconditions_describe_the_wait() {
        let registry = registry();
        let mut state = SharedState::init(seed(Variant::NaturalDisaster)).unwrap();
        state
            .merge(vec![
                ("r".to_string(), ExecutionResult::failure("boom")),
                ("v".to_string(), ExecutionResult::success(json!(1))),
            ])
            .unwrap();

        assert!(registry.ready_set(&state).is_empty());
        assert_eq!(
            registry.unmet_preconditions(&state),
            vec![PendingTask {
                task_id: "s".into(),
                unmet: "completed: r".into()
            }]
        );
    }

    #[test]
    fn test_variant_scoped_precondition() {
        let precondition = Precondition::AllOf(vec![
            Precondition::completed(["a"]),
            Precondition::for_variant(Variant::EconomicCrisis, Precondition::output("b")),
        ]);
        let natural = SharedState::init(seed(Variant::NaturalDisaster)).unwrap();
        let economic = SharedState::init(seed(Variant::EconomicCrisis)).unwrap();

        assert_eq!(
            precondition.unmet(&natural.snapshot()),
            Some("completed: a".to_string())
        );
        assert_eq!(
            precondition.unmet(&economic.snapshot()),
            Some("completed: a and output: b".to_string())
        );
        assert_eq!(precondition.dependencies(Variant::NaturalDisaster), vec!["a"]);
        assert_eq!(precondition.dependencies(Variant::EconomicCrisis), vec!["a", "b"]);
    }

    #[test]
    fn test_custom_precondition() {
        let precondition = Precondition::custom("two outputs on the board", |snap| {
            snap.outputs().len() >= 2
        });
        let state = SharedState::init(seed(Variant::NaturalDisaster)).unwrap();
        assert_eq!(
            precondition.unmet(&state.snapshot()).as_deref(),
            Some("two outputs on the board")
        );
    }

    #[test]
    fn test_dependency_cycles() {
        let registry = TaskRegistry::builder()
            .register(TaskDescriptor::new("a").needs(["b"]), noop())
            .register(TaskDescriptor::new("b").needs(["a"]), noop())
            .register(TaskDescriptor::new("c").needs(["c"]), noop())
            .register(TaskDescriptor::new("d").needs(["a"]), noop())
            .build()
            .unwrap();

        let ids = registry.ids();
        assert_eq!(
            registry.dependency_cycles(&ids, Variant::NaturalDisaster),
            vec![vec!["a".to_string(), "b".to_string()], vec!["c".to_string()]]
        );
    }

    #[test]
    fn test_builder_rejects_bad_tables() {
        let err = TaskRegistry::builder()
            .register(TaskDescriptor::new("a"), noop())
            .register(TaskDescriptor::new("a"), noop())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("registered twice"));

        let err = TaskRegistry::builder()
            .register(TaskDescriptor::new("a").needs(["ghost"]), noop())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("unknown task ghost"));

        let err = TaskRegistry::builder()
            .register(TaskDescriptor::new(" "), noop())
            .build()
            .unwrap_err();
        assert_eq!(err.category(), "configuration");
    }
}
