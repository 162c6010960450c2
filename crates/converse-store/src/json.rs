//! File-backed repositories.
//!
//! Layout under the data directory:
//!
//! ```text
//! agents/<agent_id>/info.json
//! conversations/<conversation_id>/messages.json
//! conversations/<conversation_id>/info.json
//! ```

use crate::{validate_id, AgentRepository, ConversationRepository, StoreError};
use converse_types::{Agent, ConversationInfo, ConversationRecord, Turn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const AGENTS_DIR: &str = "agents";
const CONVERSATIONS_DIR: &str = "conversations";
const INFO_FILE: &str = "info.json";
const MESSAGES_FILE: &str = "messages.json";

/// JSON snapshot store rooted at a data directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    /// Opens (and creates if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join(AGENTS_DIR))?;
        fs::create_dir_all(root.join(CONVERSATIONS_DIR))?;
        Ok(Self { root })
    }

    /// Returns the data directory this store writes into.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn agent_dir(&self, id: &str) -> Result<PathBuf, StoreError> {
        validate_id(id)?;
        Ok(self.root.join(AGENTS_DIR).join(id))
    }

    fn conversation_dir(&self, id: &str) -> Result<PathBuf, StoreError> {
        validate_id(id)?;
        Ok(self.root.join(CONVERSATIONS_DIR).join(id))
    }

    fn read_conversation(
        &self,
        dir: &Path,
        id: &str,
    ) -> Result<Option<ConversationRecord>, StoreError> {
        let Some(turns) = read_json::<Vec<Turn>>(&dir.join(MESSAGES_FILE))? else {
            return Ok(None);
        };
        let Some(info) = read_json::<ConversationInfo>(&dir.join(INFO_FILE))? else {
            return Ok(None);
        };
        Ok(Some(ConversationRecord {
            id: id.to_string(),
            info,
            turns,
        }))
    }
}

impl AgentRepository for JsonFileStore {
    fn list_agents(&self) -> Result<Vec<Agent>, StoreError> {
        let mut agents = Vec::new();
        for (id, dir) in subdirectories(&self.root.join(AGENTS_DIR))? {
            match read_json::<Agent>(&dir.join(INFO_FILE)) {
                Ok(Some(agent)) => agents.push(agent),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(agent_id = %id, "skipping unreadable agent record: {}", e)
                }
            }
        }
        Ok(agents)
    }

    fn get_agent(&self, id: &str) -> Result<Option<Agent>, StoreError> {
        read_json(&self.agent_dir(id)?.join(INFO_FILE))
    }

    fn put_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        let dir = self.agent_dir(&agent.id)?;
        fs::create_dir_all(&dir)?;
        write_json(&dir.join(INFO_FILE), agent)
    }

    fn delete_agent(&self, id: &str) -> Result<bool, StoreError> {
        remove_dir(&self.agent_dir(id)?)
    }
}

impl ConversationRepository for JsonFileStore {
    fn list_conversations(&self) -> Result<Vec<ConversationRecord>, StoreError> {
        let mut records = Vec::new();
        for (id, dir) in subdirectories(&self.root.join(CONVERSATIONS_DIR))? {
            match self.read_conversation(&dir, &id) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    conversation_id = %id,
                    "skipping unreadable conversation snapshot: {}",
                    e
                ),
            }
        }
        Ok(records)
    }

    fn get_conversation(&self, id: &str) -> Result<Option<ConversationRecord>, StoreError> {
        let dir = self.conversation_dir(id)?;
        self.read_conversation(&dir, id)
    }

    fn put_conversation(&self, record: &ConversationRecord) -> Result<(), StoreError> {
        let dir = self.conversation_dir(&record.id)?;
        fs::create_dir_all(&dir)?;
        write_json(&dir.join(MESSAGES_FILE), &record.turns)?;
        write_json(&dir.join(INFO_FILE), &record.info)
    }

    fn delete_conversation(&self, id: &str) -> Result<bool, StoreError> {
        remove_dir(&self.conversation_dir(id)?)
    }
}

/// Lists `(name, path)` for each subdirectory of `dir`.
fn subdirectories(dir: &Path) -> Result<Vec<(String, PathBuf)>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            let name = entry.file_name().to_string_lossy().into_owned();
            dirs.push((name, entry.path()));
        }
    }
    Ok(dirs)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let contents = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn remove_dir(dir: &Path) -> Result<bool, StoreError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
