//! Conversation records and their bound answer engines.
//!
//! Every conversation lives in a slot holding two things:
//!
//! - the latest record snapshot, behind a short-lived `std` lock, so reads
//!   never wait on an answer in progress;
//! - the pipeline state (the bound engine and its generation counter),
//!   behind a `tokio` mutex that a response pipeline holds from its refresh
//!   check through its final persist. Two pipelines on one conversation
//!   therefore never interleave turns, while different conversations run
//!   concurrently.
//!
//! The engine is bound lazily on first use, seeded with the full turn
//! history, and rebound whenever the conversation is refreshed.

use crate::error::ChatError;
use converse_engine::{AnswerEngine, EngineBinder, KnowledgeLibrary};
use converse_store::{AgentRepository, ConversationRepository};
use converse_types::{Agent, ConversationRecord, Role, Turn};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Turn count at which a conversation's engine is rebuilt from history.
pub const DEFAULT_REFRESH_INTERVAL: usize = 20;

/// Display name used when a conversation's agent no longer exists.
pub const UNKNOWN_AGENT_NAME: &str = "未知智能体";

/// An engine attached to a conversation.
#[derive(Clone)]
pub struct BoundEngine {
    pub handle: Arc<dyn AnswerEngine>,
    /// Increments on every (re)bind of the same conversation.
    pub generation: u64,
    /// Number of turns the engine was seeded with.
    pub seeded_turns: usize,
}

impl fmt::Debug for BoundEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundEngine")
            .field("generation", &self.generation)
            .field("seeded_turns", &self.seeded_turns)
            .field("memory_len", &self.handle.memory_len())
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub enum EngineState {
    #[default]
    Unbound,
    Bound(BoundEngine),
}

#[derive(Debug, Default)]
struct PipelineState {
    engine: EngineState,
    generation: u64,
    removed: bool,
}

struct Slot {
    pipeline: Arc<Mutex<PipelineState>>,
    record: RwLock<ConversationRecord>,
}

impl Slot {
    fn new(record: ConversationRecord) -> Arc<Self> {
        Arc::new(Self {
            pipeline: Arc::new(Mutex::new(PipelineState::default())),
            record: RwLock::new(record),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, ConversationRecord> {
        self.record.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ConversationRecord> {
        self.record.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive access to one conversation for the length of a response.
pub struct ConversationGuard {
    slot: Arc<Slot>,
    state: OwnedMutexGuard<PipelineState>,
}

impl ConversationGuard {
    pub fn id(&self) -> String {
        self.slot.read().id.clone()
    }

    pub fn agent_id(&self) -> String {
        self.slot.read().info.agent_id.clone()
    }

    pub fn turn_count(&self) -> usize {
        self.slot.read().turns.len()
    }

    pub fn snapshot(&self) -> ConversationRecord {
        self.slot.read().clone()
    }

    pub fn engine_state(&self) -> &EngineState {
        &self.state.engine
    }
}

/// List entry for a conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub agent_id: String,
    pub agent_name: String,
    pub created_at: f64,
}

/// A conversation with its messages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationDetail {
    pub id: String,
    pub title: String,
    pub agent_id: String,
    pub agent_name: String,
    pub messages: Vec<Turn>,
    pub created_at: f64,
}

/// Diagnostic view of a conversation's engine memory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryStatus {
    pub conversation_id: String,
    pub total_messages: usize,
    pub engine_loaded: bool,
    pub agent_id: String,
    pub agent_name: String,
    pub has_memory: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_messages_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_generation: Option<u64>,
}

pub struct ConversationStore {
    slots: RwLock<HashMap<String, Arc<Slot>>>,
    conversations: Arc<dyn ConversationRepository>,
    agents: Arc<dyn AgentRepository>,
    binder: Arc<dyn EngineBinder>,
    knowledge: KnowledgeLibrary,
    refresh_interval: usize,
}

impl ConversationStore {
    pub fn new(
        conversations: Arc<dyn ConversationRepository>,
        agents: Arc<dyn AgentRepository>,
        binder: Arc<dyn EngineBinder>,
        knowledge: KnowledgeLibrary,
        refresh_interval: usize,
    ) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            conversations,
            agents,
            binder,
            knowledge,
            refresh_interval: refresh_interval.max(1),
        }
    }

    pub fn refresh_interval(&self) -> usize {
        self.refresh_interval
    }

    /// Loads every persisted conversation. Engines stay unbound until first
    /// use. Returns the number of conversations now held.
    pub async fn load_all(&self) -> Result<usize, ChatError> {
        let repo = Arc::clone(&self.conversations);
        let records = tokio::task::spawn_blocking(move || repo.list_conversations()).await??;

        let mut slots = self.slots_mut();
        for record in records {
            slots
                .entry(record.id.clone())
                .or_insert_with(|| Slot::new(record));
        }
        tracing::info!(count = slots.len(), "loaded conversations");
        Ok(slots.len())
    }

    /// Creates and persists an empty conversation with `agent`.
    pub async fn create(&self, agent: &Agent) -> Result<ConversationRecord, ChatError> {
        let record = ConversationRecord::new(agent);
        self.persist(record.clone()).await?;
        self.slots_mut()
            .insert(record.id.clone(), Slot::new(record.clone()));
        tracing::info!(conversation_id = %record.id, agent_id = %agent.id, "conversation created");
        Ok(record)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slot(id).is_some()
    }

    /// Latest snapshot of a conversation.
    pub fn get(&self, id: &str) -> Option<ConversationRecord> {
        self.slot(id).map(|slot| slot.read().clone())
    }

    /// All conversations, newest first.
    pub async fn list(&self) -> Vec<ConversationSummary> {
        let names = self.agent_names().await;
        let mut summaries: Vec<ConversationSummary> = self
            .snapshots()
            .into_iter()
            .map(|record| ConversationSummary {
                agent_name: agent_name(&names, &record.info.agent_id),
                id: record.id,
                title: record.info.title,
                agent_id: record.info.agent_id,
                created_at: record.info.created_at,
            })
            .collect();
        summaries.sort_by(|a, b| b.created_at.total_cmp(&a.created_at));
        summaries
    }

    pub async fn detail(&self, id: &str) -> Result<ConversationDetail, ChatError> {
        let record = self
            .get(id)
            .ok_or_else(|| ChatError::ConversationNotFound(id.to_string()))?;
        let agent = self.load_agent(&record.info.agent_id).await?;
        Ok(ConversationDetail {
            agent_name: agent
                .map(|a| a.name)
                .unwrap_or_else(|| UNKNOWN_AGENT_NAME.to_string()),
            id: record.id,
            title: record.info.title,
            agent_id: record.info.agent_id,
            messages: record.turns,
            created_at: record.info.created_at,
        })
    }

    pub async fn rename(&self, id: &str, title: &str) -> Result<ConversationRecord, ChatError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ChatError::InvalidInput("标题不能为空".to_string()));
        }
        let guard = self.lock(id).await?;
        let (previous, snapshot) = {
            let mut record = guard.slot.write();
            let previous = std::mem::replace(&mut record.info.title, title.to_string());
            (previous, record.clone())
        };
        if let Err(e) = self.persist(snapshot.clone()).await {
            guard.slot.write().info.title = previous;
            return Err(e);
        }
        Ok(snapshot)
    }

    /// Deletes a conversation from memory and disk. A pipeline already
    /// holding the conversation finishes first.
    pub async fn delete(&self, id: &str) -> Result<(), ChatError> {
        let mut guard = self.lock(id).await?;
        guard.state.removed = true;
        guard.state.engine = EngineState::Unbound;
        self.slots_mut().remove(id);
        drop(guard);

        let repo = Arc::clone(&self.conversations);
        let id_owned = id.to_string();
        tokio::task::spawn_blocking(move || repo.delete_conversation(&id_owned)).await??;
        tracing::info!(conversation_id = %id, "conversation deleted");
        Ok(())
    }

    /// Deletes every conversation of `agent_id`. Returns how many were
    /// removed.
    pub async fn delete_for_agent(&self, agent_id: &str) -> Result<usize, ChatError> {
        let ids: Vec<String> = self
            .snapshots()
            .into_iter()
            .filter(|record| record.info.agent_id == agent_id)
            .map(|record| record.id)
            .collect();

        let mut deleted = 0;
        for id in ids {
            match self.delete(&id).await {
                Ok(()) => deleted += 1,
                // Raced with a direct delete.
                Err(ChatError::ConversationNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }

    pub async fn memory_status(&self, id: &str) -> Result<MemoryStatus, ChatError> {
        let guard = self.lock(id).await?;
        let record = guard.snapshot();
        let agent_name = self
            .load_agent(&record.info.agent_id)
            .await?
            .map(|a| a.name)
            .unwrap_or_else(|| UNKNOWN_AGENT_NAME.to_string());

        let bound = match guard.engine_state() {
            EngineState::Bound(bound) => Some(bound),
            EngineState::Unbound => None,
        };
        Ok(MemoryStatus {
            conversation_id: record.id,
            total_messages: record.turns.len(),
            engine_loaded: bound.is_some(),
            agent_id: record.info.agent_id,
            agent_name,
            has_memory: bound.is_some(),
            memory_messages_count: bound.map(|b| b.handle.memory_len()),
            engine_generation: bound.map(|b| b.generation),
        })
    }

    /// Takes exclusive access to a conversation, waiting for any response
    /// in progress on it.
    pub async fn lock(&self, id: &str) -> Result<ConversationGuard, ChatError> {
        let slot = self
            .slot(id)
            .ok_or_else(|| ChatError::ConversationNotFound(id.to_string()))?;
        let state = Arc::clone(&slot.pipeline).lock_owned().await;
        if state.removed {
            return Err(ChatError::ConversationNotFound(id.to_string()));
        }
        Ok(ConversationGuard { slot, state })
    }

    /// Returns the conversation's engine, binding one if needed. `None` if
    /// the conversation or its agent is missing or binding failed.
    pub async fn get_engine(&self, id: &str) -> Option<Arc<dyn AnswerEngine>> {
        let mut guard = self.lock(id).await.ok()?;
        self.engine_for(&mut guard).await
    }

    /// Discards the conversation's engine and binds a new one from the
    /// persisted history. Returns whether an engine is now present.
    pub async fn refresh_context(&self, id: &str) -> bool {
        match self.lock(id).await {
            Ok(mut guard) => self.refresh(&mut guard).await,
            Err(_) => false,
        }
    }

    /// [`get_engine`](Self::get_engine) for a conversation already locked.
    pub async fn engine_for(
        &self,
        guard: &mut ConversationGuard,
    ) -> Option<Arc<dyn AnswerEngine>> {
        if let EngineState::Bound(bound) = &guard.state.engine {
            return Some(Arc::clone(&bound.handle));
        }

        let record = guard.snapshot();
        match self
            .bind_for_agent(&record.info.agent_id, &record.turns)
            .await
        {
            Ok(handle) => {
                guard.state.generation += 1;
                let generation = guard.state.generation;
                guard.state.engine = EngineState::Bound(BoundEngine {
                    handle: Arc::clone(&handle),
                    generation,
                    seeded_turns: record.turns.len(),
                });
                tracing::info!(
                    conversation_id = %record.id,
                    generation,
                    seeded_turns = record.turns.len(),
                    "answer engine bound"
                );
                Some(handle)
            }
            Err(e) => {
                tracing::warn!(
                    conversation_id = %record.id,
                    agent_id = %record.info.agent_id,
                    "failed to bind answer engine: {}",
                    e
                );
                None
            }
        }
    }

    /// [`refresh_context`](Self::refresh_context) for a conversation already
    /// locked.
    pub async fn refresh(&self, guard: &mut ConversationGuard) -> bool {
        guard.state.engine = EngineState::Unbound;
        self.engine_for(guard).await.is_some()
    }

    /// Refreshes the engine when the turn count is a positive multiple of
    /// the refresh interval. Call once per request, before the user turn is
    /// appended. Returns whether a refresh ran.
    pub async fn refresh_if_due(&self, guard: &mut ConversationGuard) -> bool {
        let count = guard.turn_count();
        if count == 0 || count % self.refresh_interval != 0 {
            return false;
        }
        tracing::info!(
            conversation_id = %guard.id(),
            turns = count,
            "refreshing conversation context"
        );
        self.refresh(guard).await;
        true
    }

    /// Drops the bound engine so the next use rebinds from persisted turns.
    pub fn invalidate(&self, guard: &mut ConversationGuard) {
        guard.state.engine = EngineState::Unbound;
    }

    /// Appends `turn` and persists the snapshot. On a failed write the turn
    /// is removed again.
    pub async fn push_turn(
        &self,
        guard: &mut ConversationGuard,
        turn: Turn,
    ) -> Result<(), ChatError> {
        let snapshot = {
            let mut record = guard.slot.write();
            record.turns.push(turn);
            record.clone()
        };
        if let Err(e) = self.persist(snapshot).await {
            guard.slot.write().turns.pop();
            return Err(e);
        }
        Ok(())
    }

    /// Removes the most recent turn if it was authored by the user, and
    /// persists. The engine is discarded as well: it may already remember
    /// an exchange that no longer exists. On a failed write the turn is put
    /// back. Returns whether a turn was removed.
    pub async fn rollback_user_turn(
        &self,
        guard: &mut ConversationGuard,
    ) -> Result<bool, ChatError> {
        let (snapshot, removed) = {
            let mut record = guard.slot.write();
            if record.turns.last().map(|t| t.role) != Some(Role::User) {
                return Ok(false);
            }
            let removed = record.turns.pop();
            (record.clone(), removed)
        };
        self.invalidate(guard);
        let id = snapshot.id.clone();
        if let Err(e) = self.persist(snapshot).await {
            // Memory must keep matching what is on disk.
            guard.slot.write().turns.extend(removed);
            tracing::error!(conversation_id = %id, "rollback not persisted, user turn kept: {}", e);
            return Err(e);
        }
        tracing::info!(conversation_id = %id, "rolled back user turn");
        Ok(true)
    }

    /// Binds a new engine for `agent_id` seeded with `turns`, without
    /// attaching it to any conversation.
    pub async fn bind_for_agent(
        &self,
        agent_id: &str,
        turns: &[Turn],
    ) -> Result<Arc<dyn AnswerEngine>, ChatError> {
        let agent = self
            .load_agent(agent_id)
            .await?
            .ok_or_else(|| ChatError::AgentNotFound(agent_id.to_string()))?;

        let library = self.knowledge.clone();
        let id = agent.id.clone();
        let knowledge = tokio::task::spawn_blocking(move || library.load_or_empty(&id))
            .await
            .map_err(|e| ChatError::Binding(e.to_string()))??;

        Ok(self
            .binder
            .bind(&agent.role, Arc::new(knowledge), turns)
            .await?)
    }

    async fn persist(&self, record: ConversationRecord) -> Result<(), ChatError> {
        let repo = Arc::clone(&self.conversations);
        tokio::task::spawn_blocking(move || repo.put_conversation(&record)).await??;
        Ok(())
    }

    async fn load_agent(&self, id: &str) -> Result<Option<Agent>, ChatError> {
        let repo = Arc::clone(&self.agents);
        let id = id.to_string();
        Ok(tokio::task::spawn_blocking(move || repo.get_agent(&id)).await??)
    }

    async fn agent_names(&self) -> HashMap<String, String> {
        let repo = Arc::clone(&self.agents);
        match tokio::task::spawn_blocking(move || repo.list_agents()).await {
            Ok(Ok(agents)) => agents.into_iter().map(|a| (a.id, a.name)).collect(),
            Ok(Err(e)) => {
                tracing::warn!("failed to list agents: {}", e);
                HashMap::new()
            }
            Err(e) => {
                tracing::warn!("agent listing task failed: {}", e);
                HashMap::new()
            }
        }
    }

    fn slot(&self, id: &str) -> Option<Arc<Slot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn slots_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Slot>>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshots(&self) -> Vec<ConversationRecord> {
        let slots: Vec<Arc<Slot>> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        slots.iter().map(|slot| slot.read().clone()).collect()
    }
}

fn agent_name(names: &HashMap<String, String>, agent_id: &str) -> String {
    names
        .get(agent_id)
        .cloned()
        .unwrap_or_else(|| UNKNOWN_AGENT_NAME.to_string())
}
