//! Process engine: strategy selection, task dispatch and run bookkeeping.

mod execution;
mod result;
mod run;
mod sequential;
mod workflow;

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use weft_core::config::EngineConfig;
use weft_core::error::{GraphError, Result, WeftError};
use weft_core::graph::TaskGraph;
use weft_core::traits::{Agent, TaskObserver};
use weft_core::types::{ProcessKind, Task};

use crate::registry::AgentRegistry;
use crate::store::TaskStore;

pub use execution::{decision_expected_output, interpolate, loop_items};
pub use result::{ProcessResult, TaskReport, TerminalReason};

use run::ProcessRun;

/// Per-run options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub initial_input: Option<String>,
    /// Values for `{key}` placeholders in task descriptions.
    pub inputs: HashMap<String, String>,
    pub cancel: Option<CancellationToken>,
    /// Run id to use instead of a generated one.
    pub run_id: Option<String>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.initial_input = Some(input.into());
        self
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }
}

/// Runs a task graph with one of the three process strategies.
///
/// The engine holds the task templates; every run works on its own fresh
/// copy, so one engine can serve many runs.
pub struct ProcessEngine {
    process: ProcessKind,
    template: TaskStore,
    registry: AgentRegistry,
    manager: Option<String>,
    config: EngineConfig,
    observers: Vec<Arc<dyn TaskObserver>>,
}

impl ProcessEngine {
    pub fn builder(process: ProcessKind) -> ProcessEngineBuilder {
        ProcessEngineBuilder::new(process)
    }

    pub fn process(&self) -> ProcessKind {
        self.process
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.template.iter()
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub async fn run(&self, initial_input: Option<String>) -> ProcessResult {
        self.run_with(RunOptions {
            initial_input,
            ..RunOptions::default()
        })
        .await
    }

    pub async fn run_with(&self, options: RunOptions) -> ProcessResult {
        ProcessRun::new(self, options).execute().await
    }

    /// Blocking variant of [`run`](Self::run). Builds its own runtime, so it
    /// must not be called from inside one.
    pub fn run_blocking(&self, initial_input: Option<String>) -> Result<ProcessResult> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        Ok(runtime.block_on(self.run(initial_input)))
    }

    fn manager_agent(&self) -> Option<Arc<dyn Agent>> {
        self.manager.as_deref().and_then(|id| self.registry.get(id))
    }
}

pub struct ProcessEngineBuilder {
    process: ProcessKind,
    tasks: Vec<Task>,
    agents: Vec<Arc<dyn Agent>>,
    manager: Option<String>,
    default_agent: Option<String>,
    config: EngineConfig,
    observers: Vec<Arc<dyn TaskObserver>>,
}

impl ProcessEngineBuilder {
    pub fn new(process: ProcessKind) -> Self {
        Self {
            process,
            tasks: vec![],
            agents: vec![],
            manager: None,
            default_agent: None,
            config: EngineConfig::default(),
            observers: vec![],
        }
    }

    /// Take process kind, tasks, manager and default agent from a loaded graph.
    pub fn graph(mut self, graph: TaskGraph) -> Self {
        self.process = graph.process;
        self.tasks = graph.tasks;
        if graph.manager.is_some() {
            self.manager = graph.manager;
        }
        if graph.default_agent.is_some() {
            self.default_agent = graph.default_agent;
        }
        self
    }

    pub fn task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn tasks(mut self, tasks: Vec<Task>) -> Self {
        self.tasks.extend(tasks);
        self
    }

    pub fn agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn agents(mut self, agents: impl IntoIterator<Item = Arc<dyn Agent>>) -> Self {
        self.agents.extend(agents);
        self
    }

    /// Register `agent` and make it the manager.
    pub fn manager(mut self, agent: Arc<dyn Agent>) -> Self {
        self.manager = Some(agent.id().to_string());
        self.agents.push(agent);
        self
    }

    /// Name an already registered agent as the manager.
    pub fn manager_id(mut self, id: impl Into<String>) -> Self {
        self.manager = Some(id.into());
        self
    }

    pub fn default_agent(mut self, id: impl Into<String>) -> Self {
        self.default_agent = Some(id.into());
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_iterations(mut self, max: usize) -> Self {
        self.config.max_iterations = max;
        self
    }

    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.config.max_concurrency = max;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn TaskObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn build(self) -> Result<ProcessEngine> {
        self.config.validate()?;
        let template = TaskStore::new(self.tasks, self.process)?;

        let mut registry = AgentRegistry::new();
        for agent in self.agents {
            registry.register(agent);
        }
        if let Some(id) = &self.default_agent {
            if !registry.contains(id) {
                return Err(WeftError::AgentNotFound(id.clone()));
            }
            registry.set_default(id.clone());
        }

        match &self.manager {
            None if self.process == ProcessKind::Hierarchical => {
                return Err(GraphError::MissingManager.into());
            }
            Some(id) if !registry.contains(id) => {
                return Err(GraphError::UnknownManager(id.clone()).into());
            }
            _ => {}
        }

        let has_default = registry.default_agent(self.manager.as_deref()).is_some();
        for task in template.iter() {
            match &task.agent_ref {
                Some(agent) if !registry.contains(agent) => {
                    return Err(GraphError::UnknownAgent {
                        task: task.name.clone(),
                        agent: agent.clone(),
                    }
                    .into());
                }
                Some(_) => {}
                None if self.process != ProcessKind::Hierarchical && !has_default => {
                    return Err(GraphError::NoAgentAvailable(task.name.clone()).into());
                }
                None => {}
            }
        }

        if self.process != ProcessKind::Workflow {
            let routed: Vec<&str> = template
                .iter()
                .filter(|t| !t.next_tasks.is_empty() || t.kind.is_decision())
                .map(|t| t.name.as_str())
                .collect();
            if !routed.is_empty() {
                warn!(
                    process = %self.process,
                    tasks = ?routed,
                    "next_tasks and condition tables are ignored outside workflow mode"
                );
            }
        }

        info!(
            process = %self.process,
            tasks = template.len(),
            agents = registry.len(),
            "Process engine built"
        );

        Ok(ProcessEngine {
            process: self.process,
            template,
            registry,
            manager: self.manager,
            config: self.config,
            observers: self.observers,
        })
    }
}
