//! One task execution, detached from the store so it can run inline or on
//! the async coordinator.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::traits::Agent;
use weft_core::types::{AgentRequest, DecisionSpec, Task, TaskId, TaskResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ExecutionKind {
    Single,
    Loop {
        /// `None` means open-ended: repeat until the stop label shows up.
        items: Option<Vec<String>>,
        until: Option<String>,
        max_passes: usize,
    },
}

pub(crate) struct TaskExecution {
    pub task_id: TaskId,
    pub name: String,
    pub description: String,
    pub expected_output: String,
    pub context: String,
    pub agent: Arc<dyn Agent>,
    pub kind: ExecutionKind,
    pub feedback: Option<String>,
    pub timeout: Option<Duration>,
}

impl TaskExecution {
    pub async fn run(self) -> Result<TaskResult> {
        let started = Instant::now();
        let mut result = match &self.kind {
            ExecutionKind::Single => {
                let output = self.agent.execute(self.request(&self.context)).await?;
                TaskResult {
                    raw: output.text,
                    structured: output.structured,
                    ..TaskResult::default()
                }
            }
            ExecutionKind::Loop {
                items,
                until,
                max_passes,
            } => self.run_loop(items.as_deref(), until.as_deref(), *max_passes).await?,
        };
        result.agent_id = Some(self.agent.id().to_string());
        result.validation_feedback = self.feedback.clone();
        result.elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(result)
    }

    fn request(&self, context: &str) -> AgentRequest {
        let mut request = AgentRequest::new(self.task_id.clone(), self.name.clone());
        request.description = self.description.clone();
        request.expected_output = self.expected_output.clone();
        request.context = context.to_string();
        request.timeout = self.timeout;
        request
    }

    async fn run_loop(
        &self,
        items: Option<&[String]>,
        until: Option<&str>,
        max_passes: usize,
    ) -> Result<TaskResult> {
        let mut outputs: Vec<String> = Vec::new();

        match items {
            Some(items) => {
                let total = items.len();
                for (i, item) in items.iter().enumerate() {
                    let context = join_sections(
                        &self.context,
                        &format!("Current item ({}/{}): {}", i + 1, total, item),
                    );
                    let text = self.agent.execute(self.request(&context)).await?.text;
                    debug!(task = %self.name, pass = i + 1, total, "Loop pass finished");
                    if until.is_some_and(|u| text.trim() == u) {
                        break;
                    }
                    outputs.push(text);
                }
            }
            None => {
                let Some(until) = until else {
                    return Err(WeftError::agent(
                        self.agent.id(),
                        format!("loop task '{}' has no items and no stop label", self.name),
                    ));
                };
                let mut stopped = false;
                for pass in 1..=max_passes {
                    let context = match outputs.last() {
                        Some(previous) => join_sections(
                            &self.context,
                            &format!("## Previous pass ({}/{})\n{}", pass - 1, max_passes, previous),
                        ),
                        None => self.context.clone(),
                    };
                    let text = self.agent.execute(self.request(&context)).await?.text;
                    debug!(task = %self.name, pass, "Loop pass finished");
                    if text.trim() == until {
                        stopped = true;
                        break;
                    }
                    outputs.push(text);
                }
                if !stopped {
                    return Err(WeftError::agent(
                        self.agent.id(),
                        format!(
                            "loop task '{}' did not produce '{}' within {} passes",
                            self.name, until, max_passes
                        ),
                    ));
                }
            }
        }

        Ok(TaskResult {
            raw: outputs.join("\n\n"),
            structured: Some(serde_json::Value::Array(
                outputs.into_iter().map(serde_json::Value::String).collect(),
            )),
            ..TaskResult::default()
        })
    }
}

fn join_sections(context: &str, extra: &str) -> String {
    if context.is_empty() {
        extra.to_string()
    } else {
        format!("{context}\n\n{extra}")
    }
}

fn placeholder_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").ok())
        .as_ref()
}

/// Substitute `{key}` placeholders. Unknown keys stay as written.
pub fn interpolate(text: &str, inputs: &HashMap<String, String>) -> String {
    if inputs.is_empty() {
        return text.to_string();
    }
    let Some(re) = placeholder_re() else {
        return text.to_string();
    };
    re.replace_all(text, |caps: &regex::Captures<'_>| match inputs.get(&caps[1]) {
        Some(value) => value.clone(),
        None => caps[0].to_string(),
    })
    .into_owned()
}

/// Expected output of a decision task, with the allowed labels spelled out.
pub fn decision_expected_output(expected: &str, spec: &DecisionSpec) -> String {
    let labels = spec.labels().collect::<Vec<_>>().join(", ");
    let hint = format!("Answer with exactly one of: {labels}");
    if expected.trim().is_empty() {
        hint
    } else {
        format!("{}\n\n{}", expected.trim_end(), hint)
    }
}

/// Loop items from an upstream task: a JSON array in its structured result,
/// otherwise the non-empty lines of its raw output.
pub fn loop_items(source: &Task) -> Vec<String> {
    let Some(result) = &source.result else {
        return vec![];
    };
    if let Some(serde_json::Value::Array(values)) = &result.structured {
        return values
            .iter()
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
    }
    result
        .raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}
