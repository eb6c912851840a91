use thiserror::Error;

#[derive(Debug, Error)]
pub enum WeftError {
    // Graph errors
    #[error("Graph config error: {0}")]
    Graph(#[from] GraphError),

    // Agent errors
    #[error("Agent execution failed: {agent}: {message}")]
    AgentExecution { agent: String, message: String },

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Delegation failed: {0}")]
    Delegation(#[from] DelegationError),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WeftError {
    /// Shorthand for an agent failure on a given agent id.
    pub fn agent(agent: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AgentExecution {
            agent: agent.into(),
            message: message.into(),
        }
    }
}

/// Invalid task graph. Always fatal before any task runs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("task graph is empty")]
    Empty,

    #[error("duplicate task id '{0}'")]
    DuplicateId(String),

    #[error("duplicate task name '{0}'")]
    DuplicateName(String),

    #[error("task '{task}' references unknown task '{reference}' in `{field}`")]
    DanglingReference {
        task: String,
        field: &'static str,
        reference: String,
    },

    #[error("task '{0}' declares a condition but is not a decision task")]
    ConditionOnNonDecision(String),

    #[error("decision task '{0}' has no condition table")]
    DecisionWithoutCondition(String),

    #[error("decision task '{task}' has a malformed condition: {reason}")]
    MalformedCondition { task: String, reason: String },

    #[error("loop task '{task}' is malformed: {reason}")]
    MalformedLoop { task: String, reason: String },

    #[error("start task '{0}' must not have dependencies")]
    StartTaskWithDependencies(String),

    #[error("task '{0}' depends on itself")]
    SelfDependency(String),

    #[error("dependency cycle through task '{0}'")]
    DependencyCycle(String),

    #[error("workflow graph has no start task")]
    NoStartTask,

    #[error("task '{task}' is assigned to unknown agent '{agent}'")]
    UnknownAgent { task: String, agent: String },

    #[error("task '{0}' has no assigned agent and no default agent is available")]
    NoAgentAvailable(String),

    #[error("hierarchical process requires a manager agent")]
    MissingManager,

    #[error("manager agent '{0}' is not registered")]
    UnknownManager(String),
}

/// The manager agent could not produce a usable assignment.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DelegationError {
    #[error("no candidate agents available for task '{0}'")]
    NoCandidates(String),

    #[error("manager call failed: {0}")]
    ManagerFailed(String),

    #[error("malformed manager response: {0}")]
    Malformed(String),

    #[error("manager chose unknown agent '{agent}' (candidates: {candidates})")]
    UnknownAgent { agent: String, candidates: String },
}

pub type Result<T> = std::result::Result<T, WeftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_error_messages_name_the_task() {
        let err = GraphError::DanglingReference {
            task: "review".into(),
            field: "next_tasks",
            reference: "publish".into(),
        };
        assert_eq!(
            err.to_string(),
            "task 'review' references unknown task 'publish' in `next_tasks`"
        );
    }

    #[test]
    fn graph_error_converts_into_weft_error() {
        let err: WeftError = GraphError::NoStartTask.into();
        assert!(matches!(err, WeftError::Graph(GraphError::NoStartTask)));
        assert!(err.to_string().contains("no start task"));
    }

    #[test]
    fn agent_shorthand() {
        let err = WeftError::agent("writer", "rate limited");
        assert_eq!(err.to_string(), "Agent execution failed: writer: rate limited");
    }
}
