use std::sync::Arc;

use weft_core::traits::Agent;

/// Agents available to a process, in registration order.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: Vec<Arc<dyn Agent>>,
    default_agent: Option<String>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent. A later registration with the same id replaces
    /// the earlier one in place.
    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        match self.agents.iter().position(|a| a.id() == agent.id()) {
            Some(i) => self.agents[i] = agent,
            None => self.agents.push(agent),
        }
    }

    pub fn set_default(&mut self, id: impl Into<String>) {
        self.default_agent = Some(id.into());
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.iter().find(|a| a.id() == id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents.iter().any(|a| a.id() == id)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.agents.iter().map(|a| a.id()).collect()
    }

    /// Every agent except the manager.
    pub fn workers(&self, manager: Option<&str>) -> Vec<Arc<dyn Agent>> {
        self.agents
            .iter()
            .filter(|a| Some(a.id()) != manager)
            .cloned()
            .collect()
    }

    /// The explicitly named default, or the first registered worker.
    pub fn default_agent(&self, manager: Option<&str>) -> Option<Arc<dyn Agent>> {
        match &self.default_agent {
            Some(id) => self.get(id),
            None => self.workers(manager).into_iter().next(),
        }
    }

}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.ids())
            .field("default_agent", &self.default_agent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_test_utils::MockAgent;

    #[test]
    fn registration_order_and_default() {
        let mut registry = AgentRegistry::new();
        registry.register(Arc::new(MockAgent::new("boss")));
        registry.register(Arc::new(MockAgent::new("writer")));
        registry.register(Arc::new(MockAgent::new("editor")));

        assert_eq!(registry.ids(), vec!["boss", "writer", "editor"]);
        assert_eq!(registry.workers(Some("boss")).len(), 2);
        assert_eq!(registry.default_agent(Some("boss")).unwrap().id(), "writer");
        assert_eq!(registry.default_agent(None).unwrap().id(), "boss");

        registry.set_default("editor");
        assert_eq!(registry.default_agent(Some("boss")).unwrap().id(), "editor");
    }

    #[test]
    fn re_registration_replaces_in_place() {
        let mut registry = AgentRegistry::new();
        registry.register(Arc::new(MockAgent::new("a")));
        registry.register(Arc::new(MockAgent::new("b")));
        registry.register(Arc::new(MockAgent::new("a").with_role("second")));

        assert_eq!(registry.ids(), vec!["a", "b"]);
        assert_eq!(registry.get("a").unwrap().role(), "second");
    }

    #[test]
    fn empty_registry_has_no_default() {
        let registry = AgentRegistry::new();
        assert!(registry.default_agent(None).is_none());
        assert!(registry.is_empty());
    }
}
