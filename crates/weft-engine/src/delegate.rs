use std::sync::Arc;

use tracing::{debug, info, warn};

use weft_core::error::DelegationError;
use weft_core::traits::Agent;
use weft_core::types::{AgentOutput, AgentRequest};

/// The manager's verdict for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    Agent(String),
    Skip { reason: String },
}

/// Asks the manager agent which worker should run a task.
///
/// Every call is a fresh manager request; nothing is cached between tasks.
pub struct ManagerDelegate {
    manager: Arc<dyn Agent>,
}

impl ManagerDelegate {
    pub fn new(manager: Arc<dyn Agent>) -> Self {
        Self { manager }
    }

    pub fn manager_id(&self) -> &str {
        self.manager.id()
    }

    pub async fn assign(
        &self,
        task: &AgentRequest,
        candidates: &[Arc<dyn Agent>],
    ) -> Result<Assignment, DelegationError> {
        if candidates.is_empty() {
            return Err(DelegationError::NoCandidates(task.task_name.clone()));
        }

        let request = build_request(task, candidates);
        let output = self
            .manager
            .execute(request)
            .await
            .map_err(|e| DelegationError::ManagerFailed(e.to_string()))?;

        let assignment = parse_assignment(&output, candidates)?;
        match &assignment {
            Assignment::Agent(id) => {
                info!(task = %task.task_name, agent = %id, manager = %self.manager.id(), "Manager assigned task")
            }
            Assignment::Skip { reason } => {
                info!(task = %task.task_name, reason = %reason, "Manager skipped task")
            }
        }
        Ok(assignment)
    }
}

fn build_request(task: &AgentRequest, candidates: &[Arc<dyn Agent>]) -> AgentRequest {
    let roster = candidates
        .iter()
        .map(|a| {
            if a.role().is_empty() {
                format!("- {}", a.id())
            } else {
                format!("- {}: {}", a.id(), a.role())
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    let mut description = format!(
        "You are managing a crew. Decide which agent should carry out the task below, \
         or whether it can be skipped because it is already satisfied.\n\n\
         Task: {}\nDescription: {}\n",
        task.task_name, task.description
    );
    if !task.expected_output.is_empty() {
        description.push_str(&format!("Expected output: {}\n", task.expected_output));
    }
    description.push_str(&format!("\nAvailable agents:\n{}", roster));

    let mut request = AgentRequest::new(task.task_id.clone(), format!("delegate: {}", task.task_name));
    request.description = description;
    request.expected_output = "Respond with ONLY a JSON object, either \
        {\"agent\": \"<agent id>\"} or {\"skip\": true, \"reason\": \"<why>\"}."
        .to_string();
    request.timeout = task.timeout;
    request
}

/// Read the manager's answer. Structured output wins; otherwise JSON is
/// pulled out of the raw text.
pub fn parse_assignment(
    output: &AgentOutput,
    candidates: &[Arc<dyn Agent>],
) -> Result<Assignment, DelegationError> {
    let value = match output.structured.as_ref().filter(|v| v.is_object()) {
        Some(v) => v.clone(),
        None => serde_json::from_str::<serde_json::Value>(extract_json(&output.text)).map_err(
            |e| {
                warn!(error = %e, "Manager response is not JSON");
                DelegationError::Malformed(format!("{e}: {}", truncate(&output.text, 200)))
            },
        )?,
    };

    if value.get("skip").and_then(|v| v.as_bool()) == Some(true) {
        let reason = value
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("skipped by manager")
            .to_string();
        return Ok(Assignment::Skip { reason });
    }

    let Some(agent) = value.get("agent").and_then(|v| v.as_str()) else {
        return Err(DelegationError::Malformed(
            "expected an `agent` field or `skip: true`".into(),
        ));
    };
    let agent = agent.trim();

    if candidates.iter().any(|c| c.id() == agent) {
        debug!(agent = %agent, "Manager choice accepted");
        Ok(Assignment::Agent(agent.to_string()))
    } else {
        Err(DelegationError::UnknownAgent {
            agent: agent.to_string(),
            candidates: candidates
                .iter()
                .map(|c| c.id().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        })
    }
}

/// Extract JSON from text that may be wrapped in markdown code fences.
pub(crate) fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            if end > start {
                return &trimmed[start..=end];
            }
        }
    }
    trimmed
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_test_utils::MockAgent;

    fn crew() -> Vec<Arc<dyn Agent>> {
        vec![
            Arc::new(MockAgent::new("researcher").with_role("Finds facts")),
            Arc::new(MockAgent::new("writer").with_role("Writes prose")),
        ]
    }

    fn request() -> AgentRequest {
        let mut req = AgentRequest::new("t1".into(), "summarize");
        req.description = "Summarize the findings".into();
        req.expected_output = "One paragraph".into();
        req
    }

    #[test]
    fn extract_json_tolerates_fences() {
        assert_eq!(extract_json("```json\n{\"agent\": \"a\"}\n```"), "{\"agent\": \"a\"}");
        assert_eq!(extract_json("```\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(extract_json("Sure! {\"agent\": \"a\"} done"), "{\"agent\": \"a\"}");
    }

    #[test]
    fn parse_raw_assignment() {
        let out = AgentOutput::text("I pick: {\"agent\": \"writer\"}");
        assert_eq!(
            parse_assignment(&out, &crew()).unwrap(),
            Assignment::Agent("writer".into())
        );
    }

    #[test]
    fn parse_structured_skip() {
        let out = AgentOutput::structured(serde_json::json!({"skip": true, "reason": "already done"}));
        assert_eq!(
            parse_assignment(&out, &crew()).unwrap(),
            Assignment::Skip { reason: "already done".into() }
        );
    }

    #[test]
    fn unknown_agent_is_not_guessed() {
        let out = AgentOutput::text("{\"agent\": \"Writer\"}");
        assert!(matches!(
            parse_assignment(&out, &crew()),
            Err(DelegationError::UnknownAgent { .. })
        ));
    }

    #[test]
    fn prose_is_malformed() {
        let out = AgentOutput::text("the writer should do it");
        assert!(matches!(
            parse_assignment(&out, &crew()),
            Err(DelegationError::Malformed(_))
        ));
        let out = AgentOutput::text("{\"choice\": \"writer\"}");
        assert!(matches!(
            parse_assignment(&out, &crew()),
            Err(DelegationError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn assign_sends_roster_to_manager() {
        let manager = Arc::new(MockAgent::new("boss").respond("delegate: summarize", ["{\"agent\": \"researcher\"}"]));
        let delegate = ManagerDelegate::new(manager.clone());

        let assignment = delegate.assign(&request(), &crew()).await.unwrap();
        assert_eq!(assignment, Assignment::Agent("researcher".into()));

        let calls = manager.log().requests();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].description.contains("- writer: Writes prose"));
        assert!(calls[0].description.contains("Expected output: One paragraph"));
        assert!(calls[0].expected_output.contains("\"skip\": true"));
    }

    #[tokio::test]
    async fn empty_roster_fails_without_calling_manager() {
        let manager = Arc::new(MockAgent::new("boss"));
        let delegate = ManagerDelegate::new(manager.clone());
        let err = delegate.assign(&request(), &[]).await.unwrap_err();
        assert_eq!(err, DelegationError::NoCandidates("summarize".into()));
        assert!(manager.log().requests().is_empty());
    }

    #[tokio::test]
    async fn manager_failure_maps_to_delegation_error() {
        let manager = Arc::new(MockAgent::new("boss").fail_on("delegate: summarize"));
        let delegate = ManagerDelegate::new(manager);
        let err = delegate.assign(&request(), &crew()).await.unwrap_err();
        assert!(matches!(err, DelegationError::ManagerFailed(_)));
    }
}
