use weft_core::types::{Task, TaskStatus};

use crate::store::TaskStore;

/// Assembles the context text handed to an agent.
///
/// Sections, in order: validation feedback, run input (entry tasks only),
/// then one section per contributing upstream task.
#[derive(Debug, Clone, Default)]
pub struct ContextBuilder {
    initial_input: Option<String>,
}

impl ContextBuilder {
    pub fn new(initial_input: Option<String>) -> Self {
        Self {
            initial_input: initial_input.filter(|s| !s.trim().is_empty()),
        }
    }

    pub fn initial_input(&self) -> Option<&str> {
        self.initial_input.as_deref()
    }

    /// Context from the task's declared dependencies.
    pub fn build(&self, task: &Task, store: &TaskStore, include_input: bool) -> String {
        let sources: Vec<&Task> = task
            .dependencies
            .iter()
            .filter_map(|dep| store.get(dep))
            .collect();
        self.build_from(task, &sources, include_input)
    }

    /// Context from an explicit list of upstream tasks.
    pub fn build_from(&self, task: &Task, sources: &[&Task], include_input: bool) -> String {
        let mut sections: Vec<String> = Vec::new();

        if let Some(feedback) = task.validation_feedback.as_deref() {
            if !feedback.trim().is_empty() {
                sections.push(format!("## Validation feedback\n{}", feedback.trim()));
            }
        }

        if include_input {
            if let Some(input) = &self.initial_input {
                sections.push(format!("## Input\n{}", input));
            }
        }

        let selected: Vec<&Task> = if task.retain_full_context {
            sources.to_vec()
        } else {
            most_recent(sources).into_iter().collect()
        };

        for source in selected {
            let text = source
                .result
                .as_ref()
                .filter(|_| source.status == TaskStatus::Completed)
                .and_then(|r| r.display_text())
                .unwrap_or_else(|| format!("[{} produced no output]", source.name));
            sections.push(format!("## Context from {}\n{}", source.name, text));
        }

        sections.join("\n\n")
    }
}

/// The source that completed last. Falls back to the last declared source
/// when none has completed, so the placeholder still shows up.
fn most_recent<'a>(sources: &[&'a Task]) -> Option<&'a Task> {
    sources
        .iter()
        .copied()
        .filter(|t| t.status == TaskStatus::Completed)
        .max_by_key(|t| t.completed_seq)
        .or_else(|| sources.last().copied())
}
