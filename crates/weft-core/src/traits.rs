use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{AgentOutput, AgentRequest, TaskEvent};

/// The worker capability the engine hands tasks to.
///
/// The returned future is used both when the engine awaits a task inline
/// and when it submits the task for concurrent execution.
pub trait Agent: Send + Sync + 'static {
    /// Agent identifier, referenced by `Task::agent_ref`.
    fn id(&self) -> &str;

    /// Declared role, shown to the manager when it picks a worker.
    fn role(&self) -> &str {
        ""
    }

    /// Execute one task request.
    fn execute(&self, request: AgentRequest) -> BoxFuture<'_, Result<AgentOutput>>;
}

/// Observer notified once per finished task execution.
pub trait TaskObserver: Send + Sync + 'static {
    fn on_task_finished(&self, event: &TaskEvent);
}
