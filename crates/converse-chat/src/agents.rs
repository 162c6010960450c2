//! Agent records and their knowledge-base artifacts.

use crate::error::ChatError;
use converse_engine::KnowledgeLibrary;
use converse_store::AgentRepository;
use converse_types::{unix_now, Agent, AgentType};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Upload extensions accepted for a knowledge base. Only the text formats
/// are indexed; the rest are kept for reference.
pub const ALLOWED_EXTENSIONS: &[&str] = &["pdf", "docx", "txt", "md"];

/// Fields of an agent supplied by the caller.
#[derive(Debug, Clone)]
pub struct NewAgent {
    pub name: String,
    pub role: String,
    pub agent_type: AgentType,
}

/// One uploaded knowledge-base file.
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

pub struct AgentRegistry {
    repo: Arc<dyn AgentRepository>,
    uploads_root: PathBuf,
    knowledge: KnowledgeLibrary,
}

impl AgentRegistry {
    pub fn new(
        repo: Arc<dyn AgentRepository>,
        uploads_root: impl Into<PathBuf>,
        knowledge: KnowledgeLibrary,
    ) -> Self {
        Self {
            repo,
            uploads_root: uploads_root.into(),
            knowledge,
        }
    }

    /// Stores the uploads, builds the knowledge index and persists the
    /// agent. A failed index build leaves the agent without a knowledge
    /// base rather than failing creation.
    pub async fn create(&self, new: NewAgent, uploads: Vec<Upload>) -> Result<Agent, ChatError> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(ChatError::InvalidInput("智能体名称不能为空".to_string()));
        }

        let mut agent = Agent {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            role: new.role.trim().to_string(),
            agent_type: new.agent_type,
            type_name: new.agent_type.type_name().to_string(),
            created_at: unix_now(),
            has_knowledge_base: false,
        };

        let upload_dir = self.uploads_root.join(&agent.id);
        let library = self.knowledge.clone();
        let agent_id = agent.id.clone();
        agent.has_knowledge_base = tokio::task::spawn_blocking(move || -> Result<bool, ChatError> {
            let stored = store_uploads(&upload_dir, uploads)?;
            if stored == 0 {
                return Ok(false);
            }
            match library.build_from_uploads(&agent_id, &upload_dir) {
                Ok(chunks) => Ok(chunks > 0),
                Err(e) => {
                    tracing::warn!(agent_id = %agent_id, "knowledge base build failed: {}", e);
                    Ok(false)
                }
            }
        })
        .await??;

        let repo = Arc::clone(&self.repo);
        let record = agent.clone();
        tokio::task::spawn_blocking(move || repo.put_agent(&record)).await??;
        tracing::info!(
            agent_id = %agent.id,
            agent_type = %agent.agent_type,
            has_knowledge_base = agent.has_knowledge_base,
            "agent created"
        );
        Ok(agent)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Agent>, ChatError> {
        let repo = Arc::clone(&self.repo);
        let id = id.to_string();
        Ok(tokio::task::spawn_blocking(move || repo.get_agent(&id)).await??)
    }

    /// All agents, oldest first.
    pub async fn list(&self) -> Result<Vec<Agent>, ChatError> {
        let repo = Arc::clone(&self.repo);
        let mut agents = tokio::task::spawn_blocking(move || repo.list_agents()).await??;
        agents.sort_by(|a, b| a.created_at.total_cmp(&b.created_at));
        Ok(agents)
    }

    /// The oldest agent of the given type.
    pub async fn find_by_type(&self, agent_type: AgentType) -> Result<Option<Agent>, ChatError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|agent| agent.agent_type == agent_type))
    }

    /// Removes the agent record, its uploads and its knowledge index.
    /// Returns the removed agent, or `None` if it did not exist.
    pub async fn delete(&self, id: &str) -> Result<Option<Agent>, ChatError> {
        let Some(agent) = self.get(id).await? else {
            return Ok(None);
        };

        let repo = Arc::clone(&self.repo);
        let library = self.knowledge.clone();
        let upload_dir = self.uploads_root.join(&agent.id);
        let agent_id = agent.id.clone();
        tokio::task::spawn_blocking(move || -> Result<(), ChatError> {
            remove_dir_if_present(&upload_dir)?;
            if let Err(e) = library.remove(&agent_id) {
                tracing::warn!(agent_id = %agent_id, "failed to remove knowledge index: {}", e);
            }
            repo.delete_agent(&agent_id)?;
            Ok(())
        })
        .await??;

        tracing::info!(agent_id = %agent.id, "agent deleted");
        Ok(Some(agent))
    }
}

/// Writes allowed uploads into `dir`. Returns how many were stored.
fn store_uploads(dir: &Path, uploads: Vec<Upload>) -> Result<usize, ChatError> {
    let mut stored = 0;
    for upload in uploads {
        let Some(file_name) = sanitize_file_name(&upload.file_name) else {
            tracing::warn!(file = %upload.file_name, "skipping upload with unusable name");
            continue;
        };
        if !has_allowed_extension(&file_name) {
            tracing::warn!(file = %file_name, "skipping upload with unsupported extension");
            continue;
        }
        fs::create_dir_all(dir).map_err(|e| ChatError::Persistence(e.to_string()))?;
        fs::write(dir.join(&file_name), &upload.bytes)
            .map_err(|e| ChatError::Persistence(format!("{}: {}", file_name, e)))?;
        stored += 1;
    }
    Ok(stored)
}

fn remove_dir_if_present(dir: &Path) -> Result<(), ChatError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ChatError::Persistence(e.to_string())),
    }
}

pub fn has_allowed_extension(file_name: &str) -> bool {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ALLOWED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Reduces an uploaded file name to a safe base name. Directory parts are
/// dropped and anything other than letters, digits, `.`, `-` and `_`
/// becomes `_`.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    (!cleaned.is_empty() && cleaned.chars().any(|c| c != '_' && c != '.'))
        .then(|| cleaned.to_string())
}
