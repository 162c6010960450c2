use crate::{validate_id, AgentRepository, ConversationRepository, StoreError};
use converse_types::{Agent, ConversationRecord};
use std::collections::HashMap;
use std::sync::RwLock;

/// In-process repositories with no durability. Used by tests and by
/// deployments that do not want anything written to disk.
#[derive(Debug, Default)]
pub struct MemoryStore {
    agents: RwLock<HashMap<String, Agent>>,
    conversations: RwLock<HashMap<String, ConversationRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AgentRepository for MemoryStore {
    fn list_agents(&self) -> Result<Vec<Agent>, StoreError> {
        let agents = self.agents.read().map_err(|_| StoreError::Poisoned)?;
        Ok(agents.values().cloned().collect())
    }

    fn get_agent(&self, id: &str) -> Result<Option<Agent>, StoreError> {
        let agents = self.agents.read().map_err(|_| StoreError::Poisoned)?;
        Ok(agents.get(id).cloned())
    }

    fn put_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        validate_id(&agent.id)?;
        let mut agents = self.agents.write().map_err(|_| StoreError::Poisoned)?;
        agents.insert(agent.id.clone(), agent.clone());
        Ok(())
    }

    fn delete_agent(&self, id: &str) -> Result<bool, StoreError> {
        let mut agents = self.agents.write().map_err(|_| StoreError::Poisoned)?;
        Ok(agents.remove(id).is_some())
    }
}

impl ConversationRepository for MemoryStore {
    fn list_conversations(&self) -> Result<Vec<ConversationRecord>, StoreError> {
        let conversations = self.conversations.read().map_err(|_| StoreError::Poisoned)?;
        Ok(conversations.values().cloned().collect())
    }

    fn get_conversation(&self, id: &str) -> Result<Option<ConversationRecord>, StoreError> {
        let conversations = self.conversations.read().map_err(|_| StoreError::Poisoned)?;
        Ok(conversations.get(id).cloned())
    }

    fn put_conversation(&self, record: &ConversationRecord) -> Result<(), StoreError> {
        validate_id(&record.id)?;
        let mut conversations = self.conversations.write().map_err(|_| StoreError::Poisoned)?;
        conversations.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn delete_conversation(&self, id: &str) -> Result<bool, StoreError> {
        let mut conversations = self.conversations.write().map_err(|_| StoreError::Poisoned)?;
        Ok(conversations.remove(id).is_some())
    }
}
