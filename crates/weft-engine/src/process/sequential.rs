//! Sequential and hierarchical strategies: tasks in supplied order.

use tracing::debug;

use weft_core::types::{Task, TaskId, TaskStatus};

use super::run::{ProcessRun, Selection};
use crate::coordinator::AsyncHandle;

impl ProcessRun<'_> {
    pub(super) async fn run_sequential(&mut self) {
        let order = self.store.ids();

        for (position, id) in order.iter().enumerate() {
            if self.halt.is_some() {
                break;
            }
            let Some(task) = self.store.get(id) else {
                continue;
            };

            // A synchronous task waits for everything in flight; an async one
            // only for the dependencies it reads.
            let waits: Vec<AsyncHandle> = if task.async_execution {
                task.dependencies
                    .iter()
                    .filter_map(|dep| self.handles.get(dep).cloned())
                    .collect()
            } else {
                self.outstanding()
            };
            if !self.join(&waits).await {
                break;
            }

            let Some(task) = self.store.get(id) else {
                continue;
            };
            // A failed async dependency still counts as joined.
            if !self.store.dependencies_satisfied(task) {
                let missing: Vec<String> = task
                    .dependencies
                    .iter()
                    .filter_map(|dep| self.store.get(dep))
                    .filter(|dep| {
                        dep.status != TaskStatus::Completed
                            && !(dep.async_execution && dep.status == TaskStatus::Failed)
                    })
                    .map(|dep| dep.name.clone())
                    .collect();
                let message = format!(
                    "task '{}' not started: dependencies did not complete ({})",
                    task.name,
                    missing.join(", ")
                );
                self.diagnostic(message);
                continue;
            }

            let agent = match self.select_agent(id).await {
                Selection::Agent(agent) => agent,
                Selection::Settled => continue,
                Selection::Halted => break,
            };

            let context = self.sequential_context(id, &order[..position], position == 0);
            debug!(task = %id, context_len = context.len(), "Context assembled");
            if !self.dispatch(id, agent, context).await {
                break;
            }
        }

        let rest = self.outstanding();
        self.join(&rest).await;
    }

    /// Declared dependencies when there are any, otherwise every task that
    /// already completed earlier in the order.
    fn sequential_context(&self, id: &TaskId, prior: &[TaskId], is_first: bool) -> String {
        let Some(task) = self.store.get(id) else {
            return String::new();
        };
        if !task.dependencies.is_empty() {
            return self.context.build(task, &self.store, is_first);
        }
        let sources: Vec<&Task> = prior
            .iter()
            .filter_map(|p| self.store.get(p))
            .filter(|p| p.status == TaskStatus::Completed)
            .collect();
        self.context.build_from(task, &sources, is_first)
    }
}
