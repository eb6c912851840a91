use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique task identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Execution strategy for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    /// Tasks run strictly in the supplied order.
    #[default]
    Sequential,
    /// Sequential ordering, but a manager agent picks each unassigned worker.
    Hierarchical,
    /// General graph execution from the start tasks.
    Workflow,
}

impl std::fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessKind::Sequential => write!(f, "sequential"),
            ProcessKind::Hierarchical => write!(f, "hierarchical"),
            ProcessKind::Workflow => write!(f, "workflow"),
        }
    }
}

/// Scheduling status of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::NotStarted => write!(f, "not_started"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// What kind of task this is. The condition table only exists on `Decision`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    #[default]
    Normal,
    Decision(DecisionSpec),
    Loop(LoopSpec),
}

impl TaskKind {
    pub fn is_decision(&self) -> bool {
        matches!(self, TaskKind::Decision(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::Normal => "normal",
            TaskKind::Decision(_) => "decision",
            TaskKind::Loop(_) => "loop",
        }
    }
}

/// Condition table of a decision task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionSpec {
    /// Output label -> tasks to activate. An empty list terminates the branch.
    pub condition: BTreeMap<String, Vec<TaskId>>,
    /// Labels whose raw output is attached to re-entered tasks as validation feedback.
    #[serde(default = "default_feedback_labels")]
    pub feedback_labels: Vec<String>,
}

fn default_feedback_labels() -> Vec<String> {
    vec!["invalid".to_string()]
}

impl Default for DecisionSpec {
    fn default() -> Self {
        Self {
            condition: BTreeMap::new(),
            feedback_labels: default_feedback_labels(),
        }
    }
}

impl DecisionSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `label` to the given tasks.
    pub fn on(mut self, label: impl Into<String>, targets: Vec<TaskId>) -> Self {
        self.condition.insert(label.into(), targets);
        self
    }

    /// End the branch when `label` is produced.
    pub fn terminate_on(mut self, label: impl Into<String>) -> Self {
        self.condition.insert(label.into(), vec![]);
        self
    }

    pub fn with_feedback_labels(mut self, labels: Vec<String>) -> Self {
        self.feedback_labels = labels;
        self
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.condition.keys().map(String::as_str)
    }

    pub fn is_feedback_label(&self, label: &str) -> bool {
        self.feedback_labels.iter().any(|l| l == label)
    }
}

/// Iteration settings of a loop task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopSpec {
    /// Static input collection.
    #[serde(default)]
    pub items: Vec<String>,
    /// Dependency whose result supplies the input collection.
    #[serde(default)]
    pub items_from: Option<TaskId>,
    /// Output that ends the loop early.
    #[serde(default)]
    pub until: Option<String>,
    /// Pass bound for loops without an input collection.
    #[serde(default = "default_max_passes")]
    pub max_passes: usize,
}

fn default_max_passes() -> usize {
    10
}

impl Default for LoopSpec {
    fn default() -> Self {
        Self {
            items: vec![],
            items_from: None,
            until: None,
            max_passes: default_max_passes(),
        }
    }
}

impl LoopSpec {
    pub fn over(items: Vec<String>) -> Self {
        Self {
            items,
            ..Self::default()
        }
    }

    pub fn until(label: impl Into<String>) -> Self {
        Self {
            until: Some(label.into()),
            ..Self::default()
        }
    }

    pub fn from_task(mut self, task: impl Into<TaskId>) -> Self {
        self.items_from = Some(task.into());
        self
    }

    pub fn stop_on(mut self, label: impl Into<String>) -> Self {
        self.until = Some(label.into());
        self
    }

    pub fn with_max_passes(mut self, passes: usize) -> Self {
        self.max_passes = passes;
        self
    }
}

/// Output of one successful task execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub raw: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<serde_json::Value>,
    /// Feedback the attempt was given, if it was a re-entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub elapsed_ms: u64,
    /// The manager judged the task already satisfied.
    #[serde(default)]
    pub skipped: bool,
}

impl TaskResult {
    pub fn new(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            ..Self::default()
        }
    }

    pub fn with_structured(mut self, value: serde_json::Value) -> Self {
        self.structured = Some(value);
        self
    }

    /// Text to show downstream: the raw output, or the structured payload if raw is blank.
    pub fn display_text(&self) -> Option<String> {
        if !self.raw.trim().is_empty() {
            return Some(self.raw.clone());
        }
        self.structured
            .as_ref()
            .filter(|v| !v.is_null())
            .map(|v| serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string()))
    }
}

/// A unit of work in the graph.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub description: String,
    pub expected_output: String,
    /// Statically assigned worker, if any.
    pub agent_ref: Option<String>,
    pub kind: TaskKind,
    pub dependencies: Vec<TaskId>,
    pub next_tasks: Vec<TaskId>,
    pub is_start: bool,
    pub async_execution: bool,
    pub retain_full_context: bool,
    pub max_retries: u32,

    pub status: TaskStatus,
    pub result: Option<TaskResult>,

    // Runtime bookkeeping, reset with every fresh run.
    pub retries: u32,
    pub attempts: u32,
    pub validation_feedback: Option<String>,
    pub error: Option<String>,
    pub completed_seq: Option<u64>,
    pub retry_exhausted: bool,
}

pub fn default_max_retries() -> u32 {
    3
}

impl Task {
    /// Create a task with an explicit id.
    pub fn new(id: impl Into<TaskId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            expected_output: String::new(),
            agent_ref: None,
            kind: TaskKind::Normal,
            dependencies: vec![],
            next_tasks: vec![],
            is_start: false,
            async_execution: false,
            retain_full_context: false,
            max_retries: default_max_retries(),
            status: TaskStatus::NotStarted,
            result: None,
            retries: 0,
            attempts: 0,
            validation_feedback: None,
            error: None,
            completed_seq: None,
            retry_exhausted: false,
        }
    }

    /// Create a task with a generated id.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(TaskId::new(), name)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_expected_output(mut self, expected: impl Into<String>) -> Self {
        self.expected_output = expected.into();
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent_ref = Some(agent.into());
        self
    }

    pub fn depends_on(mut self, deps: Vec<TaskId>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn then(mut self, next: Vec<TaskId>) -> Self {
        self.next_tasks = next;
        self
    }

    pub fn start(mut self) -> Self {
        self.is_start = true;
        self
    }

    pub fn run_async(mut self) -> Self {
        self.async_execution = true;
        self
    }

    pub fn retain_full_context(mut self) -> Self {
        self.retain_full_context = true;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn decision(mut self, spec: DecisionSpec) -> Self {
        self.kind = TaskKind::Decision(spec);
        self
    }

    pub fn looping(mut self, spec: LoopSpec) -> Self {
        self.kind = TaskKind::Loop(spec);
        self
    }

    pub fn condition(&self) -> Option<&BTreeMap<String, Vec<TaskId>>> {
        match &self.kind {
            TaskKind::Decision(spec) => Some(&spec.condition),
            _ => None,
        }
    }

    /// Every task id this task refers to, tagged with the field it came from.
    pub fn references(&self) -> Vec<(&'static str, &TaskId)> {
        let mut refs: Vec<(&'static str, &TaskId)> = Vec::new();
        refs.extend(self.dependencies.iter().map(|d| ("dependencies", d)));
        refs.extend(self.next_tasks.iter().map(|n| ("next_tasks", n)));
        match &self.kind {
            TaskKind::Decision(spec) => {
                refs.extend(spec.condition.values().flatten().map(|t| ("condition", t)));
            }
            TaskKind::Loop(spec) => {
                refs.extend(spec.items_from.iter().map(|t| ("items_from", t)));
            }
            TaskKind::Normal => {}
        }
        refs
    }

    /// Clear runtime state so the task can be scheduled in a fresh run.
    pub fn reset_runtime(&mut self) {
        self.status = TaskStatus::NotStarted;
        self.result = None;
        self.retries = 0;
        self.attempts = 0;
        self.validation_feedback = None;
        self.error = None;
        self.completed_seq = None;
        self.retry_exhausted = false;
    }
}

/// Request handed to an agent for one execution.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub task_id: TaskId,
    pub task_name: String,
    pub description: String,
    pub expected_output: String,
    pub context: String,
    /// Per-call timeout for the agent to honour. Not enforced by the engine.
    pub timeout: Option<Duration>,
}

impl AgentRequest {
    pub fn new(task_id: TaskId, task_name: impl Into<String>) -> Self {
        Self {
            task_id,
            task_name: task_name.into(),
            description: String::new(),
            expected_output: String::new(),
            context: String::new(),
            timeout: None,
        }
    }
}

/// What an agent returns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentOutput {
    pub text: String,
    pub structured: Option<serde_json::Value>,
}

impl AgentOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            structured: None,
        }
    }

    pub fn structured(value: serde_json::Value) -> Self {
        Self {
            text: String::new(),
            structured: Some(value),
        }
    }

    pub fn with_structured(mut self, value: serde_json::Value) -> Self {
        self.structured = Some(value);
        self
    }
}

/// Emitted once per finished task execution.
#[derive(Debug, Clone, Serialize)]
pub struct TaskEvent {
    pub run_id: String,
    pub task_id: TaskId,
    pub task_name: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempt: u32,
    pub retry_exhausted: bool,
    pub timestamp: DateTime<Utc>,
}
