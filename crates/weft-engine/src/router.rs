use tracing::{debug, warn};

use weft_core::types::{DecisionSpec, TaskId, TaskResult, TaskStatus};

use crate::store::TaskStore;

/// Where a decision output leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// The label names targets to (re-)enter.
    Matched {
        label: String,
        targets: Vec<TaskId>,
        feedback: Option<String>,
    },
    /// The label maps to an empty list: this branch ends here.
    Terminate { label: String },
    /// No entry for the label: fall through to `next_tasks`.
    PassThrough { label: String, targets: Vec<TaskId> },
}

impl Route {
    pub fn label(&self) -> &str {
        match self {
            Route::Matched { label, .. }
            | Route::Terminate { label }
            | Route::PassThrough { label, .. } => label,
        }
    }
}

/// What applying a route changed in the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteReport {
    pub activated: Vec<TaskId>,
    pub exhausted: Vec<TaskId>,
    pub diagnostics: Vec<String>,
}

impl RouteReport {
    fn merge(&mut self, other: RouteReport) {
        self.activated.extend(other.activated);
        self.exhausted.extend(other.exhausted);
        self.diagnostics.extend(other.diagnostics);
    }
}

pub struct ConditionRouter;

impl ConditionRouter {
    /// The label a decision result stands for.
    pub fn label(result: &TaskResult) -> String {
        structured_str(result, &["label", "decision"])
            .unwrap_or(result.raw.as_str())
            .trim()
            .to_string()
    }

    /// Pure evaluation of a decision result against its condition table.
    pub fn evaluate(spec: &DecisionSpec, next_tasks: &[TaskId], result: &TaskResult) -> Route {
        let label = Self::label(result);
        match spec.condition.get(&label) {
            None => Route::PassThrough {
                label,
                targets: next_tasks.to_vec(),
            },
            Some(targets) if targets.is_empty() => Route::Terminate { label },
            Some(targets) => {
                let feedback = spec.is_feedback_label(&label).then(|| {
                    structured_str(result, &["feedback", "reason"])
                        .unwrap_or(result.raw.as_str())
                        .trim()
                        .to_string()
                });
                Route::Matched {
                    label,
                    targets: targets.clone(),
                    feedback,
                }
            }
        }
    }

    /// Write a route into the store.
    pub fn apply(route: &Route, store: &mut TaskStore) -> RouteReport {
        match route {
            Route::Terminate { label } => {
                debug!(label = %label, "Branch terminated");
                RouteReport::default()
            }
            Route::PassThrough { label, targets } => {
                debug!(label = %label, targets = targets.len(), "No condition entry, passing through");
                activate_successors(targets, store)
            }
            Route::Matched {
                label,
                targets,
                feedback,
            } => {
                debug!(label = %label, targets = targets.len(), "Condition matched");
                let mut report = RouteReport::default();
                for target in targets {
                    report.merge(reenter(target, feedback.as_deref(), store));
                }
                report
            }
        }
    }
}

/// Activate `next_tasks` successors. Finished targets are reset so they run
/// again; this does not count against their retry budget.
pub fn activate_successors(targets: &[TaskId], store: &mut TaskStore) -> RouteReport {
    let mut report = RouteReport::default();
    for target in targets {
        let Some(status) = store.get(target).map(|t| t.status) else {
            continue;
        };
        match status {
            TaskStatus::InProgress => {
                report.diagnostics.push(format!(
                    "successor '{}' still in progress, not re-activated",
                    name_of(store, target)
                ));
            }
            TaskStatus::Completed | TaskStatus::Failed => {
                store.reset(target);
                store.activate(target);
                report.activated.push(target.clone());
            }
            TaskStatus::NotStarted => {
                store.activate(target);
                report.activated.push(target.clone());
            }
        }
    }
    report
}

fn reenter(target: &TaskId, feedback: Option<&str>, store: &mut TaskStore) -> RouteReport {
    let mut report = RouteReport::default();
    let name = name_of(store, target);
    let Some(task) = store.get_mut(target) else {
        return report;
    };

    let status = task.status;
    match status {
        TaskStatus::InProgress => {
            report
                .diagnostics
                .push(format!("task '{name}' is in progress, re-entry skipped"));
            return report;
        }
        TaskStatus::Completed | TaskStatus::Failed => {
            if task.retries >= task.max_retries {
                task.retry_exhausted = true;
                warn!(task = %name, retries = task.retries, "Retry budget exhausted");
                report.diagnostics.push(format!(
                    "retry budget exhausted for task '{name}' after {} re-entries",
                    task.retries
                ));
                report.exhausted.push(target.clone());
                return report;
            }
            task.retries += 1;
            debug!(task = %name, retry = task.retries, "Re-entering task");
            store.reset(target);
        }
        TaskStatus::NotStarted => {}
    }

    if let Some(task) = store.get_mut(target) {
        if let Some(feedback) = feedback.filter(|f| !f.is_empty()) {
            task.validation_feedback = Some(feedback.to_string());
        }
    }
    store.activate(target);
    report.activated.push(target.clone());
    report
}

fn name_of(store: &TaskStore, id: &TaskId) -> String {
    store
        .get(id)
        .map(|t| t.name.clone())
        .unwrap_or_else(|| id.to_string())
}

fn structured_str<'a>(result: &'a TaskResult, keys: &[&str]) -> Option<&'a str> {
    let value = result.structured.as_ref()?;
    keys.iter().find_map(|k| value.get(*k).and_then(|v| v.as_str()))
}
