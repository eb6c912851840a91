//! Graph configuration: on-disk task graphs and their validation.
//!
//! A graph file is YAML, JSON or TOML (picked by extension). Task
//! references may use either the task id or its name; they are resolved
//! to ids before validation so every error names a concrete task.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::expand_env_vars;
use crate::error::{GraphError, Result, WeftError};
use crate::types::{
    default_max_retries, DecisionSpec, LoopSpec, ProcessKind, Task, TaskId, TaskKind,
};

/// On-disk graph format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphFormat {
    Yaml,
    Json,
    Toml,
}

impl GraphFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "yaml" | "yml" => Some(Self::Yaml),
            "json" => Some(Self::Json),
            "toml" => Some(Self::Toml),
            _ => None,
        }
    }
}

/// Raw graph file contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSpec {
    #[serde(default)]
    pub process: ProcessKind,
    /// Manager agent id (hierarchical process).
    #[serde(default)]
    pub manager: Option<String>,
    /// Worker used by tasks without an `agent`.
    #[serde(default)]
    pub default_agent: Option<String>,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSpecKind {
    #[default]
    Normal,
    Decision,
    Loop,
}

/// A condition target: `null`, a single task, or a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub expected_output: String,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub kind: TaskSpecKind,
    #[serde(default, alias = "context")]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub next_tasks: Vec<String>,
    #[serde(default)]
    pub condition: Option<BTreeMap<String, Option<OneOrMany>>>,
    #[serde(default)]
    pub feedback_labels: Option<Vec<String>>,
    #[serde(default)]
    pub is_start: bool,
    #[serde(default)]
    pub async_execution: bool,
    #[serde(default)]
    pub retain_full_context: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    // Loop settings
    #[serde(default)]
    pub items: Vec<String>,
    #[serde(default)]
    pub items_from: Option<String>,
    #[serde(default)]
    pub until: Option<String>,
    #[serde(default)]
    pub max_passes: Option<usize>,
}

/// A validated task graph, ready to hand to the engine builder.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    pub process: ProcessKind,
    pub manager: Option<String>,
    pub default_agent: Option<String>,
    pub tasks: Vec<Task>,
}

impl GraphSpec {
    /// Read and parse a graph file. `${ENV}` references are expanded first.
    pub fn from_path(path: &Path) -> Result<Self> {
        let format = GraphFormat::from_path(path).ok_or_else(|| {
            WeftError::Config(format!(
                "unsupported graph format: {} (expected .yaml, .yml, .json or .toml)",
                path.display()
            ))
        })?;
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeftError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&expand_env_vars(&content), format)
    }

    pub fn parse(content: &str, format: GraphFormat) -> Result<Self> {
        match format {
            GraphFormat::Yaml => {
                serde_yaml::from_str(content).map_err(|e| WeftError::Config(e.to_string()))
            }
            GraphFormat::Json => Ok(serde_json::from_str(content)?),
            GraphFormat::Toml => {
                toml::from_str(content).map_err(|e| WeftError::Config(e.to_string()))
            }
        }
    }

    /// Resolve references, build `Task`s and validate the result.
    pub fn into_graph(self) -> std::result::Result<TaskGraph, GraphError> {
        let ids: Vec<TaskId> = self
            .tasks
            .iter()
            .map(|t| t.id.clone().map(TaskId::from).unwrap_or_default())
            .collect();

        let known_ids: HashSet<&str> = ids.iter().map(TaskId::as_str).collect();
        let mut by_name: HashMap<&str, &TaskId> = HashMap::new();
        for (spec, id) in self.tasks.iter().zip(&ids) {
            by_name.entry(spec.name.as_str()).or_insert(id);
        }

        // Unknown references are kept verbatim and reported by validation.
        let resolve = |reference: &str| -> TaskId {
            if known_ids.contains(reference) {
                TaskId::from(reference)
            } else if let Some(id) = by_name.get(reference) {
                (*id).clone()
            } else {
                TaskId::from(reference)
            }
        };

        let mut tasks = Vec::with_capacity(self.tasks.len());
        for (spec, id) in self.tasks.iter().zip(&ids) {
            let kind = match spec.kind {
                TaskSpecKind::Normal | TaskSpecKind::Loop if spec.condition.is_some() => {
                    return Err(GraphError::ConditionOnNonDecision(spec.name.clone()));
                }
                TaskSpecKind::Normal => TaskKind::Normal,
                TaskSpecKind::Decision => {
                    let table = spec
                        .condition
                        .as_ref()
                        .ok_or_else(|| GraphError::DecisionWithoutCondition(spec.name.clone()))?;
                    let mut decision = DecisionSpec::new();
                    for (label, targets) in table {
                        let targets = targets
                            .clone()
                            .map(OneOrMany::into_vec)
                            .unwrap_or_default()
                            .iter()
                            .map(|t| resolve(t))
                            .collect();
                        decision = decision.on(label.clone(), targets);
                    }
                    if let Some(labels) = &spec.feedback_labels {
                        decision = decision.with_feedback_labels(labels.clone());
                    }
                    TaskKind::Decision(decision)
                }
                TaskSpecKind::Loop => {
                    let mut spec_loop = LoopSpec::over(spec.items.clone());
                    spec_loop.items_from = spec.items_from.as_deref().map(resolve);
                    spec_loop.until = spec.until.clone();
                    if let Some(passes) = spec.max_passes {
                        spec_loop.max_passes = passes;
                    }
                    TaskKind::Loop(spec_loop)
                }
            };

            let mut task = Task::new(id.clone(), spec.name.clone())
                .with_description(spec.description.clone())
                .with_expected_output(spec.expected_output.clone())
                .depends_on(spec.dependencies.iter().map(|d| resolve(d)).collect())
                .then(spec.next_tasks.iter().map(|n| resolve(n)).collect())
                .with_max_retries(spec.max_retries);
            task.kind = kind;
            task.agent_ref = spec.agent.clone();
            task.is_start = spec.is_start;
            task.async_execution = spec.async_execution;
            task.retain_full_context = spec.retain_full_context;
            tasks.push(task);
        }

        let graph = TaskGraph {
            process: self.process,
            manager: self.manager,
            default_agent: self.default_agent,
            tasks,
        };
        graph.validate()?;
        debug!(tasks = graph.tasks.len(), process = %graph.process, "Graph loaded");
        Ok(graph)
    }
}

impl TaskGraph {
    /// Build a graph from in-memory tasks.
    pub fn new(process: ProcessKind, tasks: Vec<Task>) -> Self {
        Self {
            process,
            manager: None,
            default_agent: None,
            tasks,
        }
    }

    pub fn with_manager(mut self, manager: impl Into<String>) -> Self {
        self.manager = Some(manager.into());
        self
    }

    /// Load, resolve and validate a graph file.
    pub fn load(path: &Path) -> Result<Self> {
        Ok(GraphSpec::from_path(path)?.into_graph()?)
    }

    pub fn validate(&self) -> std::result::Result<(), GraphError> {
        validate_tasks(&self.tasks, self.process)
    }

    /// Every agent id the graph names, manager included, in first-seen order.
    pub fn agent_ids(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        let named = self
            .manager
            .iter()
            .chain(self.default_agent.iter())
            .chain(self.tasks.iter().filter_map(|t| t.agent_ref.as_ref()));
        for id in named {
            if seen.insert(id.clone()) {
                out.push(id.clone());
            }
        }
        out
    }
}

/// Structural validation shared by the loader and the engine builder.
pub fn validate_tasks(tasks: &[Task], process: ProcessKind) -> std::result::Result<(), GraphError> {
    if tasks.is_empty() {
        return Err(GraphError::Empty);
    }

    let mut index: HashMap<&TaskId, usize> = HashMap::new();
    let mut names: HashSet<&str> = HashSet::new();
    for (i, task) in tasks.iter().enumerate() {
        if index.insert(&task.id, i).is_some() {
            return Err(GraphError::DuplicateId(task.id.to_string()));
        }
        if !names.insert(task.name.as_str()) {
            return Err(GraphError::DuplicateName(task.name.clone()));
        }
    }

    for task in tasks {
        for (field, reference) in task.references() {
            if !index.contains_key(reference) {
                return Err(GraphError::DanglingReference {
                    task: task.name.clone(),
                    field,
                    reference: reference.to_string(),
                });
            }
        }

        if task.dependencies.contains(&task.id) {
            return Err(GraphError::SelfDependency(task.name.clone()));
        }
        if task.is_start && !task.dependencies.is_empty() {
            return Err(GraphError::StartTaskWithDependencies(task.name.clone()));
        }

        match &task.kind {
            TaskKind::Decision(spec) => {
                if spec.condition.is_empty() {
                    return Err(GraphError::DecisionWithoutCondition(task.name.clone()));
                }
                if spec.condition.keys().any(|label| label.trim().is_empty()) {
                    return Err(GraphError::MalformedCondition {
                        task: task.name.clone(),
                        reason: "condition labels must not be blank".into(),
                    });
                }
            }
            TaskKind::Loop(spec) => validate_loop(task, spec)?,
            TaskKind::Normal => {}
        }
    }

    let mut visiting = HashSet::new();
    let mut visited = HashSet::new();
    for i in 0..tasks.len() {
        if let Some(at) = find_cycle(i, tasks, &index, &mut visiting, &mut visited) {
            return Err(GraphError::DependencyCycle(tasks[at].name.clone()));
        }
    }

    if process == ProcessKind::Workflow && !tasks.iter().any(|t| t.is_start) {
        return Err(GraphError::NoStartTask);
    }

    Ok(())
}

fn validate_loop(task: &Task, spec: &LoopSpec) -> std::result::Result<(), GraphError> {
    let malformed = |reason: &str| GraphError::MalformedLoop {
        task: task.name.clone(),
        reason: reason.to_string(),
    };
    if spec.items.is_empty() && spec.items_from.is_none() && spec.until.is_none() {
        return Err(malformed("needs `items`, `items_from` or `until`"));
    }
    if let Some(source) = &spec.items_from {
        if !task.dependencies.contains(source) {
            return Err(malformed("`items_from` must be listed in `dependencies`"));
        }
    }
    if spec.max_passes == 0 {
        return Err(malformed("`max_passes` must be greater than 0"));
    }
    Ok(())
}

/// Depth-first search over dependency edges. Returns the task where a
/// cycle was closed.
fn find_cycle(
    at: usize,
    tasks: &[Task],
    index: &HashMap<&TaskId, usize>,
    visiting: &mut HashSet<usize>,
    visited: &mut HashSet<usize>,
) -> Option<usize> {
    if visiting.contains(&at) {
        return Some(at);
    }
    if visited.contains(&at) {
        return None;
    }

    visiting.insert(at);
    for dep in &tasks[at].dependencies {
        if let Some(&next) = index.get(dep) {
            if let Some(found) = find_cycle(next, tasks, index, visiting, visited) {
                return Some(found);
            }
        }
    }
    visiting.remove(&at);
    visited.insert(at);
    None
}
