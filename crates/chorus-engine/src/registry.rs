use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use chorus_core::ids::AgentId;
use chorus_core::profile::AgentSummary;

use crate::agent::Agent;
use crate::error::RegistryError;

/// Agents by id, kept in registration order.
///
/// Built once at startup and then shared read-only.
#[derive(Default)]
pub struct AgentRegistry {
    agents: Vec<Arc<dyn Agent>>,
    index: HashMap<AgentId, usize>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an agent. Fails if the id is taken.
    pub fn register(&mut self, agent: Arc<dyn Agent>) -> Result<(), RegistryError> {
        let id = agent.id().clone();
        if self.index.contains_key(&id) {
            return Err(RegistryError::DuplicateAgent(id));
        }
        self.index.insert(id, self.agents.len());
        self.agents.push(agent);
        Ok(())
    }

    /// Insert or overwrite. An overwritten agent keeps its listing position.
    /// Returns the agent that was replaced, if any.
    pub fn replace(&mut self, agent: Arc<dyn Agent>) -> Option<Arc<dyn Agent>> {
        if let Some(&pos) = self.index.get(agent.id()) {
            return Some(std::mem::replace(&mut self.agents[pos], agent));
        }
        self.index.insert(agent.id().clone(), self.agents.len());
        self.agents.push(agent);
        None
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Agent>> {
        let pos = *self.index.get(id)?;
        Some(Arc::clone(&self.agents[pos]))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// All agents in registration order.
    pub fn list(&self) -> &[Arc<dyn Agent>] {
        &self.agents
    }

    /// Listing view in registration order.
    pub fn summaries(&self) -> Vec<AgentSummary> {
        self.agents.iter().map(|a| a.profile().summary()).collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Run every agent's setup in order, stopping at the first failure.
    pub async fn initialize_all(&self) -> Result<(), RegistryError> {
        for agent in &self.agents {
            agent.initialize().await?;
        }
        info!(count = self.agents.len(), "agents initialized");
        Ok(())
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.agents.iter().map(|a| a.id().as_str()))
            .finish()
    }
}
