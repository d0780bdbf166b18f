//! Workflow definitions and loading.
//!
//! Workflows are defined in YAML (or built in code) and name a strategy
//! plus the provider operations it composes. Transforms and aggregators
//! are either built-in kinds, names resolved against the coordinator's
//! registry at run time, or closures supplied in code.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::error::CoordinatorError;
use crate::domain::{Strategy, UnitResult};

/// `transform(output, current_input) -> next_input`
pub type TransformFn = Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>;

/// `aggregate(master_output, sub_results) -> result`
pub type AggregatorFn = Arc<dyn Fn(&Value, &[UnitResult]) -> Value + Send + Sync>;

/// Maps a unit's output (and the input it was given) to the next input
///
/// YAML forms:
/// - `transform: { kind: pick, path: summary.text }`
/// - `transform: { kind: merge_input }`
/// - `transform: { kind: wrap, key: text }`
/// - `transform: { kind: named, name: my_transform }`
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transform {
    /// Pass the output through unchanged
    Identity,

    /// Select a dotted path from the output (`null` if absent)
    Pick { path: String },

    /// Shallow-merge an object output over an object input
    MergeInput,

    /// Wrap the output as `{ key: output }`
    Wrap { key: String },

    /// Function registered on the coordinator
    Named { name: String },

    /// Closure supplied in code
    #[serde(skip)]
    Custom(TransformFn),
}

impl Transform {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Value, &Value) -> Value + Send + Sync + 'static,
    {
        Transform::Custom(Arc::new(f))
    }

    /// Produce the next input
    pub fn apply(
        &self,
        output: &Value,
        input: &Value,
        registry: &HashMap<String, TransformFn>,
    ) -> Result<Value, CoordinatorError> {
        let next = match self {
            Transform::Identity => output.clone(),
            Transform::Pick { path } => pick(output, path).cloned().unwrap_or(Value::Null),
            Transform::MergeInput => match (input, output) {
                (Value::Object(base), Value::Object(over)) => {
                    let mut merged = base.clone();
                    merged.extend(over.iter().map(|(k, v)| (k.clone(), v.clone())));
                    Value::Object(merged)
                }
                _ => output.clone(),
            },
            Transform::Wrap { key } => {
                let mut map = Map::new();
                map.insert(key.clone(), output.clone());
                Value::Object(map)
            }
            Transform::Named { name } => {
                let f = registry
                    .get(name)
                    .ok_or_else(|| CoordinatorError::UnknownTransform(name.clone()))?;
                f(output, input)
            }
            Transform::Custom(f) => f(output, input),
        };
        Ok(next)
    }

    /// Registry name this transform depends on
    pub fn required_name(&self) -> Option<&str> {
        match self {
            Transform::Named { name } => Some(name),
            _ => None,
        }
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::Identity => f.write_str("Identity"),
            Transform::Pick { path } => f.debug_struct("Pick").field("path", path).finish(),
            Transform::MergeInput => f.write_str("MergeInput"),
            Transform::Wrap { key } => f.debug_struct("Wrap").field("key", key).finish(),
            Transform::Named { name } => f.debug_struct("Named").field("name", name).finish(),
            Transform::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Combines a hierarchical run's master output with its sub-results
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Aggregator {
    /// Array of sub-task outputs in order (`null` for failures)
    Collect,

    /// Function registered on the coordinator
    Named { name: String },

    /// Closure supplied in code
    #[serde(skip)]
    Custom(AggregatorFn),
}

impl Aggregator {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Value, &[UnitResult]) -> Value + Send + Sync + 'static,
    {
        Aggregator::Custom(Arc::new(f))
    }

    pub fn aggregate(
        &self,
        master: &Value,
        subs: &[UnitResult],
        registry: &HashMap<String, AggregatorFn>,
    ) -> Result<Value, CoordinatorError> {
        match self {
            Aggregator::Collect => Ok(Value::Array(
                subs.iter()
                    .map(|u| u.output.clone().unwrap_or(Value::Null))
                    .collect(),
            )),
            Aggregator::Named { name } => registry
                .get(name)
                .map(|f| f(master, subs))
                .ok_or_else(|| CoordinatorError::UnknownAggregator(name.clone())),
            Aggregator::Custom(f) => Ok(f(master, subs)),
        }
    }

    /// Envelope used when no aggregator is configured
    pub fn default_envelope(master: &Value, subs: &[UnitResult]) -> Value {
        json!({
            "master": master,
            "sub": subs.iter().map(UnitResult::to_envelope).collect::<Vec<_>>(),
        })
    }
}

impl fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregator::Collect => f.write_str("Collect"),
            Aggregator::Named { name } => f.debug_struct("Named").field("name", name).finish(),
            Aggregator::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// One step of a sequential workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub provider: String,
    pub operation: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,
}

impl Step {
    pub fn new(provider: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            operation: operation.into(),
            transform: None,
        }
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }
}

/// One task of a parallel workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub provider: String,
    pub operation: String,

    /// Overrides the shared input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

impl Task {
    pub fn new(provider: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            operation: operation.into(),
            input: None,
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }
}

/// Master unit of a hierarchical workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    pub provider: String,
    pub operation: String,
}

impl Invocation {
    pub fn new(provider: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            operation: operation.into(),
        }
    }
}

/// Sub-task of a hierarchical workflow, fed from the master output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    pub provider: String,
    pub operation: String,

    /// `(master_output, original_input) -> input`; master output if unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_transform: Option<Transform>,
}

impl SubTask {
    pub fn new(provider: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            operation: operation.into(),
            input_transform: None,
        }
    }

    pub fn with_input_transform(mut self, transform: Transform) -> Self {
        self.input_transform = Some(transform);
        self
    }
}

/// Strategy plus its configuration
#[derive(Debug, Clone)]
pub enum WorkflowPlan {
    Sequential {
        steps: Vec<Step>,
    },
    Parallel {
        tasks: Vec<Task>,
    },
    Hierarchical {
        master: Invocation,
        sub_tasks: Vec<SubTask>,
        aggregator: Option<Aggregator>,
    },
}

impl WorkflowPlan {
    pub fn strategy(&self) -> Strategy {
        match self {
            WorkflowPlan::Sequential { .. } => Strategy::Sequential,
            WorkflowPlan::Parallel { .. } => Strategy::Parallel,
            WorkflowPlan::Hierarchical { .. } => Strategy::Hierarchical,
        }
    }

    /// Every provider the plan invokes, in definition order
    pub fn providers(&self) -> Vec<&str> {
        match self {
            WorkflowPlan::Sequential { steps } => steps.iter().map(|s| s.provider.as_str()).collect(),
            WorkflowPlan::Parallel { tasks } => tasks.iter().map(|t| t.provider.as_str()).collect(),
            WorkflowPlan::Hierarchical {
                master, sub_tasks, ..
            } => std::iter::once(master.provider.as_str())
                .chain(sub_tasks.iter().map(|s| s.provider.as_str()))
                .collect(),
        }
    }

    /// Registered transform names the plan refers to
    pub fn transform_names(&self) -> Vec<&str> {
        match self {
            WorkflowPlan::Sequential { steps } => steps
                .iter()
                .filter_map(|s| s.transform.as_ref()?.required_name())
                .collect(),
            WorkflowPlan::Parallel { .. } => Vec::new(),
            WorkflowPlan::Hierarchical { sub_tasks, .. } => sub_tasks
                .iter()
                .filter_map(|s| s.input_transform.as_ref()?.required_name())
                .collect(),
        }
    }

    /// Registered aggregator name the plan refers to
    pub fn aggregator_name(&self) -> Option<&str> {
        match self {
            WorkflowPlan::Hierarchical {
                aggregator: Some(Aggregator::Named { name }),
                ..
            } => Some(name),
            _ => None,
        }
    }

    /// Units recorded by a complete run (master excluded)
    pub fn unit_count(&self) -> usize {
        match self {
            WorkflowPlan::Sequential { steps } => steps.len(),
            WorkflowPlan::Parallel { tasks } => tasks.len(),
            WorkflowPlan::Hierarchical { sub_tasks, .. } => sub_tasks.len(),
        }
    }
}

/// A named, reusable workflow
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub name: String,
    pub description: Option<String>,
    pub plan: WorkflowPlan,
}

/// On-disk shape; the strategy stays a string until validated
#[derive(Debug, Deserialize)]
struct DefinitionDocument {
    name: String,
    #[serde(default)]
    description: Option<String>,
    strategy: String,
    #[serde(default)]
    steps: Option<Vec<Step>>,
    #[serde(default)]
    tasks: Option<Vec<Task>>,
    #[serde(default)]
    master: Option<Invocation>,
    #[serde(default)]
    sub_tasks: Option<Vec<SubTask>>,
    #[serde(default)]
    aggregator: Option<Aggregator>,
}

impl WorkflowDefinition {
    pub fn sequential(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self::from_plan(name, WorkflowPlan::Sequential { steps })
    }

    pub fn parallel(name: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self::from_plan(name, WorkflowPlan::Parallel { tasks })
    }

    pub fn hierarchical(
        name: impl Into<String>,
        master: Invocation,
        sub_tasks: Vec<SubTask>,
        aggregator: Option<Aggregator>,
    ) -> Self {
        Self::from_plan(
            name,
            WorkflowPlan::Hierarchical {
                master,
                sub_tasks,
                aggregator,
            },
        )
    }

    fn from_plan(name: impl Into<String>, plan: WorkflowPlan) -> Self {
        Self {
            name: name.into(),
            description: None,
            plan,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn strategy(&self) -> Strategy {
        self.plan.strategy()
    }

    /// Load a workflow from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow file: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Failed to load workflow: {}", path.display()))
    }

    /// Parse a workflow from YAML (or JSON) content
    pub fn from_yaml(content: &str) -> Result<Self, CoordinatorError> {
        let doc: DefinitionDocument = serde_yaml::from_str(content)
            .map_err(|e| CoordinatorError::InvalidDefinition(e.to_string()))?;
        Self::try_from(doc)
    }

    /// Load every `*.yaml` / `*.yml` workflow in a directory, sorted by
    /// file name. A missing directory yields no workflows.
    pub fn load_dir(dir: &Path) -> Result<Vec<Self>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut paths: Vec<_> = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read workflows directory: {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect();
        paths.sort();

        paths.iter().map(|p| Self::from_file(p)).collect()
    }

    /// Structural checks (non-empty name and units)
    pub fn validate(&self) -> Result<(), CoordinatorError> {
        if self.name.trim().is_empty() {
            return Err(CoordinatorError::InvalidDefinition(
                "workflow name cannot be empty".to_string(),
            ));
        }

        let empty = match &self.plan {
            WorkflowPlan::Sequential { steps } => steps.is_empty().then_some("steps"),
            WorkflowPlan::Parallel { tasks } => tasks.is_empty().then_some("tasks"),
            WorkflowPlan::Hierarchical { .. } => None,
        };
        if let Some(field) = empty {
            return Err(CoordinatorError::InvalidDefinition(format!(
                "workflow '{}' must have at least one entry in '{}'",
                self.name, field
            )));
        }

        Ok(())
    }
}

impl TryFrom<DefinitionDocument> for WorkflowDefinition {
    type Error = CoordinatorError;

    fn try_from(doc: DefinitionDocument) -> Result<Self, Self::Error> {
        let strategy = Strategy::parse(&doc.strategy).ok_or_else(|| {
            CoordinatorError::UnknownStrategy {
                workflow: doc.name.clone(),
                strategy: doc.strategy.clone(),
            }
        })?;

        let missing = |field: &str| {
            CoordinatorError::InvalidDefinition(format!(
                "{} workflow '{}' requires '{}'",
                strategy, doc.name, field
            ))
        };

        let plan = match strategy {
            Strategy::Sequential => WorkflowPlan::Sequential {
                steps: doc.steps.ok_or_else(|| missing("steps"))?,
            },
            Strategy::Parallel => WorkflowPlan::Parallel {
                tasks: doc.tasks.ok_or_else(|| missing("tasks"))?,
            },
            Strategy::Hierarchical => WorkflowPlan::Hierarchical {
                master: doc.master.ok_or_else(|| missing("master"))?,
                sub_tasks: doc.sub_tasks.unwrap_or_default(),
                aggregator: doc.aggregator,
            },
        };

        let definition = WorkflowDefinition {
            name: doc.name,
            description: doc.description,
            plan,
        };
        definition.validate()?;
        Ok(definition)
    }
}

/// Follow a dotted path (`a.b.0.c`) through objects and arrays
pub fn pick<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }

    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sequential_yaml() {
        let yaml = r#"
name: summarize-then-tag
description: Summarize input, then extract tags
strategy: sequential
steps:
  - provider: fabric
    operation: summarize
    transform:
      kind: wrap
      key: text
  - provider: fabric
    operation: extract_tags
"#;

        let workflow = WorkflowDefinition::from_yaml(yaml).unwrap();
        assert_eq!(workflow.name, "summarize-then-tag");
        assert_eq!(workflow.strategy(), Strategy::Sequential);
        assert_eq!(workflow.plan.unit_count(), 2);

        match &workflow.plan {
            WorkflowPlan::Sequential { steps } => {
                assert!(matches!(steps[0].transform, Some(Transform::Wrap { .. })));
                assert!(steps[1].transform.is_none());
            }
            other => panic!("unexpected plan {:?}", other),
        }
    }

    #[test]
    fn test_parse_hierarchical_yaml() {
        let yaml = r#"
name: research
strategy: hierarchical
master:
  provider: planner
  operation: outline
sub_tasks:
  - provider: writer
    operation: draft
    input_transform:
      kind: pick
      path: sections.0
  - provider: writer
    operation: draft
aggregator:
  kind: named
  name: stitch
"#;

        let workflow = WorkflowDefinition::from_yaml(yaml).unwrap();
        assert_eq!(workflow.plan.providers(), vec!["planner", "writer", "writer"]);
        assert_eq!(workflow.plan.aggregator_name(), Some("stitch"));
        assert!(workflow.plan.transform_names().is_empty());
    }

    #[test]
    fn test_unknown_strategy() {
        let yaml = "name: odd\nstrategy: round_robin\ntasks: []\n";
        let err = WorkflowDefinition::from_yaml(yaml).unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::UnknownStrategy { ref strategy, .. } if strategy == "round_robin"
        ));
    }

    #[test]
    fn test_missing_strategy_config() {
        let yaml = "name: empty\nstrategy: parallel\n";
        assert!(matches!(
            WorkflowDefinition::from_yaml(yaml).unwrap_err(),
            CoordinatorError::InvalidDefinition(_)
        ));

        let yaml = "name: empty\nstrategy: sequential\nsteps: []\n";
        assert!(matches!(
            WorkflowDefinition::from_yaml(yaml).unwrap_err(),
            CoordinatorError::InvalidDefinition(_)
        ));
    }

    #[test]
    fn test_transforms() {
        let registry = HashMap::new();
        let output = json!({"summary": {"text": "short"}, "score": 2});
        let input = json!({"score": 1, "lang": "en"});

        let picked = Transform::Pick {
            path: "summary.text".to_string(),
        }
        .apply(&output, &input, &registry)
        .unwrap();
        assert_eq!(picked, json!("short"));

        let merged = Transform::MergeInput.apply(&output, &input, &registry).unwrap();
        assert_eq!(merged["score"], 2);
        assert_eq!(merged["lang"], "en");

        let wrapped = Transform::Wrap {
            key: "data".to_string(),
        }
        .apply(&json!(5), &input, &registry)
        .unwrap();
        assert_eq!(wrapped, json!({"data": 5}));

        let err = Transform::Named {
            name: "missing".to_string(),
        }
        .apply(&output, &input, &registry)
        .unwrap_err();
        assert!(matches!(err, CoordinatorError::UnknownTransform(_)));
    }

    #[test]
    fn test_pick_paths() {
        let value = json!({"items": [{"id": 7}]});
        assert_eq!(pick(&value, "items.0.id"), Some(&json!(7)));
        assert_eq!(pick(&value, "items.3.id"), None);
        assert_eq!(pick(&value, ""), Some(&value));
    }

    #[test]
    fn test_load_dir_skips_other_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("b.yaml"),
            "name: b\nstrategy: parallel\ntasks:\n  - provider: p\n    operation: op\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("a.yml"),
            "name: a\nstrategy: sequential\nsteps:\n  - provider: p\n    operation: op\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a workflow").unwrap();

        let workflows = WorkflowDefinition::load_dir(dir.path()).unwrap();
        let names: Vec<_> = workflows.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let missing = WorkflowDefinition::load_dir(&dir.path().join("nope")).unwrap();
        assert!(missing.is_empty());
    }
}
