use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant as StdInstant;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use weft_core::error::WeftError;
use weft_core::traits::Agent;
use weft_core::types::{
    AgentRequest, ProcessKind, TaskEvent, TaskId, TaskKind, TaskResult, TaskStatus,
};

use super::execution::{
    decision_expected_output, interpolate, loop_items, ExecutionKind, TaskExecution,
};
use super::result::{ProcessResult, TaskReport, TerminalReason};
use super::{ProcessEngine, RunOptions};
use crate::context::ContextBuilder;
use crate::coordinator::{AsyncCompletion, AsyncCoordinator, AsyncHandle, AsyncOutcome};
use crate::delegate::{Assignment, ManagerDelegate};
use crate::router::{activate_successors, ConditionRouter};
use crate::store::TaskStore;

const INTERRUPTED: &str = "interrupted";

/// Why scheduling stopped early. Ordered by precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(super) enum Halt {
    MaxIterations,
    TimedOut,
    Cancelled,
}

/// Who runs a task, or whether it was already settled.
pub(super) enum Selection {
    Agent(Arc<dyn Agent>),
    Settled,
    Halted,
}

/// Await `fut` unless the run deadline passes or the run is cancelled first.
pub(super) async fn guarded<F: Future>(
    fut: F,
    deadline: Option<Instant>,
    cancel: &CancellationToken,
) -> Result<F::Output, Halt> {
    let expiry = async move {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Halt::Cancelled),
        _ = expiry => Err(Halt::TimedOut),
        out = fut => Ok(out),
    }
}

/// State of one run. All store mutation happens through this type, on the
/// control loop.
pub(super) struct ProcessRun<'e> {
    pub(super) engine: &'e ProcessEngine,
    pub(super) run_id: String,
    pub(super) store: TaskStore,
    pub(super) context: ContextBuilder,
    pub(super) coordinator: AsyncCoordinator,
    pub(super) handles: HashMap<TaskId, AsyncHandle>,
    pub(super) deadline: Option<Instant>,
    pub(super) cancel: CancellationToken,
    pub(super) halt: Option<Halt>,
    inputs: HashMap<String, String>,
    delegate: Option<ManagerDelegate>,
    execution_order: Vec<TaskId>,
    iterations: usize,
    diagnostics: Vec<String>,
    started: StdInstant,
}

impl<'e> ProcessRun<'e> {
    pub(super) fn new(engine: &'e ProcessEngine, options: RunOptions) -> Self {
        let delegate = match engine.process {
            ProcessKind::Hierarchical => engine.manager_agent().map(ManagerDelegate::new),
            _ => None,
        };
        Self {
            engine,
            run_id: options
                .run_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            store: engine.template.fresh(),
            context: ContextBuilder::new(options.initial_input),
            coordinator: AsyncCoordinator::new(engine.config.max_concurrency),
            handles: HashMap::new(),
            deadline: engine.config.run_timeout().map(|t| Instant::now() + t),
            cancel: options.cancel.unwrap_or_default(),
            halt: None,
            inputs: options.inputs,
            delegate,
            execution_order: Vec::new(),
            iterations: 0,
            diagnostics: Vec::new(),
            started: StdInstant::now(),
        }
    }

    pub(super) async fn execute(mut self) -> ProcessResult {
        info!(
            run_id = %self.run_id,
            process = %self.engine.process,
            tasks = self.store.len(),
            "Process run started"
        );
        match self.engine.process {
            ProcessKind::Workflow => self.run_workflow().await,
            ProcessKind::Sequential | ProcessKind::Hierarchical => self.run_sequential().await,
        }
        self.finish().await
    }

    pub(super) fn set_halt(&mut self, halt: Halt) {
        if self.halt.map_or(true, |h| halt > h) {
            warn!(run_id = %self.run_id, halt = ?halt, "Run halted");
            self.halt = Some(halt);
        }
    }

    pub(super) fn diagnostic(&mut self, message: String) {
        warn!(run_id = %self.run_id, "{}", message);
        self.diagnostics.push(message);
    }

    /// Count a task execution and move the task to `InProgress`. Returns
    /// false when the run must stop scheduling instead.
    pub(super) fn begin(&mut self, id: &TaskId) -> bool {
        if self.halt.is_some() {
            return false;
        }
        if self.cancel.is_cancelled() {
            self.set_halt(Halt::Cancelled);
            return false;
        }
        if self.deadline.is_some_and(|at| Instant::now() >= at) {
            self.set_halt(Halt::TimedOut);
            return false;
        }
        if self.iterations >= self.engine.config.max_iterations {
            self.diagnostic(format!(
                "iteration bound of {} task executions reached",
                self.engine.config.max_iterations
            ));
            self.set_halt(Halt::MaxIterations);
            return false;
        }

        self.iterations += 1;
        let attempt = self.store.mark_in_progress(id);
        self.execution_order.push(id.clone());
        if let Some(task) = self.store.get(id) {
            info!(run_id = %self.run_id, task = %task.name, attempt, "Task started");
        }
        true
    }

    /// Static assignment, manager delegation, or the default agent.
    pub(super) async fn select_agent(&mut self, id: &TaskId) -> Selection {
        let Some(agent_ref) = self.store.get(id).map(|t| t.agent_ref.clone()) else {
            return Selection::Settled;
        };
        let engine = self.engine;
        let manager = engine.manager.as_deref();

        if let Some(agent_id) = agent_ref {
            return match engine.registry.get(&agent_id) {
                Some(agent) => Selection::Agent(agent),
                None => self.settle_failed(id, WeftError::AgentNotFound(agent_id)),
            };
        }

        let Some(delegate) = &self.delegate else {
            return match engine.registry.default_agent(manager) {
                Some(agent) => Selection::Agent(agent),
                None => self.settle_failed(id, WeftError::AgentNotFound("default".into())),
            };
        };

        let brief = self.brief(id);
        let workers = engine.registry.workers(manager);
        let manager_id = delegate.manager_id().to_string();
        let verdict = guarded(delegate.assign(&brief, &workers), self.deadline, &self.cancel).await;

        match verdict {
            Err(halt) => {
                self.set_halt(halt);
                Selection::Halted
            }
            Ok(Ok(Assignment::Agent(agent_id))) => match engine.registry.get(&agent_id) {
                Some(agent) => Selection::Agent(agent),
                None => self.settle_failed(id, WeftError::AgentNotFound(agent_id)),
            },
            Ok(Ok(Assignment::Skip { reason })) => {
                if !self.begin(id) {
                    return Selection::Halted;
                }
                let result = TaskResult {
                    raw: reason,
                    agent_id: Some(manager_id),
                    skipped: true,
                    ..TaskResult::default()
                };
                self.apply_outcome(id, Ok(result));
                Selection::Settled
            }
            Ok(Err(e)) => self.settle_failed(id, WeftError::Delegation(e)),
        }
    }

    fn settle_failed(&mut self, id: &TaskId, err: WeftError) -> Selection {
        if !self.begin(id) {
            return Selection::Halted;
        }
        self.apply_outcome(id, Err(err.to_string()));
        Selection::Settled
    }

    /// The task as the agent will see it, without context.
    fn brief(&self, id: &TaskId) -> AgentRequest {
        let mut request = AgentRequest::new(id.clone(), String::new());
        if let Some(task) = self.store.get(id) {
            request.task_name = task.name.clone();
            request.description = interpolate(&task.description, &self.inputs);
            request.expected_output = interpolate(&task.expected_output, &self.inputs);
            if self.engine.process == ProcessKind::Workflow {
                if let TaskKind::Decision(spec) = &task.kind {
                    request.expected_output =
                        decision_expected_output(&request.expected_output, spec);
                }
            }
        }
        request.timeout = self.engine.config.task_timeout();
        request
    }

    fn build_execution(
        &self,
        id: &TaskId,
        agent: Arc<dyn Agent>,
        context: String,
    ) -> Option<TaskExecution> {
        let task = self.store.get(id)?;
        let brief = self.brief(id);
        let kind = match &task.kind {
            TaskKind::Loop(spec) => {
                let items = match &spec.items_from {
                    Some(source) => Some(self.store.get(source).map(loop_items).unwrap_or_default()),
                    None if !spec.items.is_empty() => Some(spec.items.clone()),
                    None => None,
                };
                // No items to walk: an `until` loop runs open-ended instead.
                let items = items.filter(|list| !list.is_empty() || spec.until.is_none());
                ExecutionKind::Loop {
                    items,
                    until: spec.until.clone(),
                    max_passes: spec.max_passes,
                }
            }
            TaskKind::Normal | TaskKind::Decision(_) => ExecutionKind::Single,
        };
        Some(TaskExecution {
            task_id: id.clone(),
            name: brief.task_name,
            description: brief.description,
            expected_output: brief.expected_output,
            context,
            agent,
            kind,
            feedback: task.validation_feedback.clone(),
            timeout: brief.timeout,
        })
    }

    /// Start one task: inline for synchronous tasks, on the coordinator for
    /// async ones. Returns false once the run has halted.
    pub(super) async fn dispatch(
        &mut self,
        id: &TaskId,
        agent: Arc<dyn Agent>,
        context: String,
    ) -> bool {
        let Some(execution) = self.build_execution(id, agent, context) else {
            return true;
        };
        let is_async = self
            .store
            .get(id)
            .is_some_and(|t| t.async_execution);
        if !self.begin(id) {
            return false;
        }

        if is_async {
            let handle = self.coordinator.submit(id.clone(), execution.run());
            self.handles.insert(id.clone(), handle);
            return true;
        }

        match guarded(execution.run(), self.deadline, &self.cancel).await {
            Ok(outcome) => {
                self.apply_outcome(id, outcome.map_err(|e| e.to_string()));
                true
            }
            Err(halt) => {
                self.set_halt(halt);
                false
            }
        }
    }

    pub(super) fn apply_completion(&mut self, completion: AsyncCompletion) {
        let id = completion.handle.task_id.clone();
        self.handles.remove(&id);
        let outcome = match completion.outcome {
            AsyncOutcome::Completed(result) => Ok(result),
            AsyncOutcome::Failed(err) => Err(err),
            AsyncOutcome::Cancelled => Err(INTERRUPTED.to_string()),
        };
        self.apply_outcome(&id, outcome);
    }

    /// Record a finished execution, notify observers, and route successors.
    pub(super) fn apply_outcome(&mut self, id: &TaskId, outcome: Result<TaskResult, String>) {
        let succeeded = outcome.is_ok();
        match outcome {
            Ok(result) => {
                if let Some(task) = self.store.get(id) {
                    info!(
                        run_id = %self.run_id,
                        task = %task.name,
                        elapsed_ms = result.elapsed_ms,
                        skipped = result.skipped,
                        "Task completed"
                    );
                }
                self.store.complete(id, result);
            }
            Err(err) => {
                if let Some(task) = self.store.get(id) {
                    error!(run_id = %self.run_id, task = %task.name, error = %err, "Task failed");
                }
                self.store.fail(id, err);
            }
        }
        self.notify(id);

        if succeeded && self.halt.is_none() && self.engine.process == ProcessKind::Workflow {
            self.route(id);
        }
    }

    fn route(&mut self, id: &TaskId) {
        let Some(task) = self.store.get(id) else {
            return;
        };
        let report = match (&task.kind, &task.result) {
            (TaskKind::Decision(spec), Some(result)) => {
                let route = ConditionRouter::evaluate(spec, &task.next_tasks, result);
                info!(run_id = %self.run_id, task = %task.name, label = %route.label(), "Decision evaluated");
                ConditionRouter::apply(&route, &mut self.store)
            }
            _ => {
                let next = task.next_tasks.clone();
                activate_successors(&next, &mut self.store)
            }
        };
        for message in report.diagnostics {
            self.diagnostic(message);
        }
    }

    fn notify(&self, id: &TaskId) {
        if self.engine.observers.is_empty() {
            return;
        }
        let Some(task) = self.store.get(id) else {
            return;
        };
        let event = TaskEvent {
            run_id: self.run_id.clone(),
            task_id: task.id.clone(),
            task_name: task.name.clone(),
            status: task.status,
            result: task.result.clone(),
            error: task.error.clone(),
            attempt: task.attempts,
            retry_exhausted: task.retry_exhausted,
            timestamp: Utc::now(),
        };
        for observer in &self.engine.observers {
            observer.on_task_finished(&event);
        }
    }

    /// Outstanding async handles in declaration order.
    pub(super) fn outstanding(&self) -> Vec<AsyncHandle> {
        self.store
            .iter()
            .filter_map(|t| self.handles.get(&t.id).cloned())
            .collect()
    }

    /// Join `handles` and apply their outcomes. Returns false on halt.
    pub(super) async fn join(&mut self, handles: &[AsyncHandle]) -> bool {
        if handles.is_empty() {
            return true;
        }
        match guarded(self.coordinator.join(handles), self.deadline, &self.cancel).await {
            Ok(completions) => {
                for completion in completions {
                    self.apply_completion(completion);
                }
                true
            }
            Err(halt) => {
                self.set_halt(halt);
                false
            }
        }
    }

    async fn finish(mut self) -> ProcessResult {
        // An iteration halt still lets in-flight work report back.
        while matches!(self.halt, None | Some(Halt::MaxIterations)) && !self.coordinator.is_idle() {
            match guarded(self.coordinator.next_completed(), self.deadline, &self.cancel).await {
                Ok(Some(completion)) => self.apply_completion(completion),
                Ok(None) => break,
                Err(halt) => self.set_halt(halt),
            }
        }

        if !self.coordinator.is_idle() {
            for completion in self.coordinator.cancel_all().await {
                self.apply_completion(completion);
            }
        }

        for id in self.store.in_progress() {
            self.store.fail(&id, INTERRUPTED);
            self.notify(&id);
        }

        let terminal = self.terminal();
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        info!(
            run_id = %self.run_id,
            terminal = %terminal,
            iterations = self.iterations,
            elapsed_ms,
            "Process run finished"
        );

        ProcessResult {
            run_id: self.run_id,
            terminal,
            tasks: self.store.iter().map(TaskReport::from).collect(),
            execution_order: self.execution_order,
            iterations: self.iterations,
            diagnostics: self.diagnostics,
            elapsed_ms,
        }
    }

    fn terminal(&self) -> TerminalReason {
        match self.halt {
            Some(Halt::Cancelled) => return TerminalReason::Cancelled,
            Some(Halt::TimedOut) => return TerminalReason::TimedOut,
            Some(Halt::MaxIterations) => return TerminalReason::MaxIterationsReached,
            None => {}
        }
        if self.store.iter().any(|t| t.retry_exhausted) {
            TerminalReason::RetryBudgetExhausted
        } else if self.store.iter().any(|t| t.status == TaskStatus::Failed) {
            TerminalReason::PartialFailure
        } else {
            TerminalReason::Completed
        }
    }
}
