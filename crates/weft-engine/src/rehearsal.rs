//! Offline rehearsal: agents that answer from a script instead of a model.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::graph::TaskGraph;
use weft_core::traits::Agent;
use weft_core::types::{AgentOutput, AgentRequest};

/// Key used for responses that apply to any task.
pub const ANY_TASK: &str = "*";

/// Script file layout:
///
/// ```yaml
/// agents:
///   writer: { role: "Writes drafts" }
/// responses:
///   writer:
///     draft: ["first attempt", "second attempt"]
///   reviewer:
///     "*": ["valid"]
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RehearsalScript {
    #[serde(default)]
    pub agents: BTreeMap<String, AgentProfile>,
    /// agent id -> task name -> outputs, consumed in order; the last repeats.
    #[serde(default)]
    pub responses: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentProfile {
    #[serde(default)]
    pub role: String,
}

impl RehearsalScript {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeftError::ConfigNotFound(path.display().to_string()))?;
        serde_yaml::from_str(&content).map_err(|e| WeftError::Config(e.to_string()))
    }

    /// One scripted agent per id named by the graph or the script, in
    /// first-seen order. A graph naming no agent gets a single `default`.
    pub fn agents_for(&self, graph: &TaskGraph) -> Vec<Arc<dyn Agent>> {
        let mut ids: Vec<String> = graph.agent_ids();
        for id in self.agents.keys().chain(self.responses.keys()) {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        if ids.is_empty() {
            ids.push("default".to_string());
        }

        ids.into_iter()
            .map(|id| {
                let role = self.agents.get(&id).map(|p| p.role.clone()).unwrap_or_default();
                let responses = self.responses.get(&id).cloned().unwrap_or_default();
                Arc::new(ScriptedAgent::new(id, role, responses)) as Arc<dyn Agent>
            })
            .collect()
    }
}

/// Answers each task from a per-task queue of canned outputs.
///
/// Outputs that parse as a JSON object or array are also returned as
/// structured output. Without a script entry the agent acknowledges the task.
pub struct ScriptedAgent {
    id: String,
    role: String,
    responses: Mutex<HashMap<String, VecDeque<String>>>,
}

impl ScriptedAgent {
    pub fn new(
        id: impl Into<String>,
        role: impl Into<String>,
        responses: BTreeMap<String, Vec<String>>,
    ) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            responses: Mutex::new(
                responses
                    .into_iter()
                    .map(|(task, outputs)| (task, outputs.into_iter().collect()))
                    .collect(),
            ),
        }
    }

    async fn next_response(&self, task_name: &str) -> Option<String> {
        let mut responses = self.responses.lock().await;
        let key = if responses.contains_key(task_name) {
            task_name
        } else {
            ANY_TASK
        };
        let queue = responses.get_mut(key)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

impl Agent for ScriptedAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn role(&self) -> &str {
        &self.role
    }

    fn execute(&self, request: AgentRequest) -> BoxFuture<'_, Result<AgentOutput>> {
        Box::pin(async move {
            let text = match self.next_response(&request.task_name).await {
                Some(text) => text,
                None => format!("{} completed by {}", request.task_name, self.id),
            };
            debug!(agent = %self.id, task = %request.task_name, "Scripted response");

            let structured = serde_json::from_str::<serde_json::Value>(text.trim())
                .ok()
                .filter(|v| v.is_object() || v.is_array());
            Ok(AgentOutput { text, structured })
        })
    }
}
