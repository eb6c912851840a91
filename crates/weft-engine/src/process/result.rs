use serde::Serialize;

use weft_core::types::{Task, TaskId, TaskStatus};

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    Completed,
    PartialFailure,
    RetryBudgetExhausted,
    MaxIterationsReached,
    TimedOut,
    Cancelled,
}

impl TerminalReason {
    pub fn is_success(self) -> bool {
        self == TerminalReason::Completed
    }
}

impl std::fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TerminalReason::Completed => "completed",
            TerminalReason::PartialFailure => "partial_failure",
            TerminalReason::RetryBudgetExhausted => "retry_budget_exhausted",
            TerminalReason::MaxIterationsReached => "max_iterations_reached",
            TerminalReason::TimedOut => "timed_out",
            TerminalReason::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Final state of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub retries: u32,
    pub retry_exhausted: bool,
    pub skipped: bool,
}

impl From<&Task> for TaskReport {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            name: task.name.clone(),
            status: task.status,
            result_text: task.result.as_ref().map(|r| r.raw.clone()),
            structured_result: task.result.as_ref().and_then(|r| r.structured.clone()),
            error: task.error.clone(),
            attempts: task.attempts,
            retries: task.retries,
            retry_exhausted: task.retry_exhausted,
            skipped: task.result.as_ref().is_some_and(|r| r.skipped),
        }
    }
}

/// Outcome of one run.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessResult {
    pub run_id: String,
    pub terminal: TerminalReason,
    /// Reports in declaration order.
    pub tasks: Vec<TaskReport>,
    /// Task ids in the order their executions started.
    pub execution_order: Vec<TaskId>,
    pub iterations: usize,
    pub diagnostics: Vec<String>,
    pub elapsed_ms: u64,
}

impl ProcessResult {
    pub fn get(&self, id: &TaskId) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn by_name(&self, name: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Execution order as task names.
    pub fn order_names(&self) -> Vec<&str> {
        self.execution_order
            .iter()
            .filter_map(|id| self.get(id).map(|t| t.name.as_str()))
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.terminal.is_success()
    }
}
