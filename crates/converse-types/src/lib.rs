//! Shared types for the Converse workspace.
//!
//! This crate provides the records every other crate passes around: agents,
//! conversation turns and metadata, the voice options used for speech
//! synthesis, and the event frames emitted over the streaming HTTP response
//! and the live voice channel.
//!
//! The serde shapes here are also the on-disk and on-wire shapes, so field
//! names must not change without a migration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod events;
pub mod voice;

pub use events::{LiveCommand, LiveEvent, StreamEvent};
pub use voice::VoiceOptions;

/// Agent categories. The category drives intent routing: a Chinese teacher
/// hands arithmetic questions over to a math teacher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentType {
    /// General-purpose assistant.
    #[default]
    Default,
    /// Chinese language teacher.
    ChineseTeacher,
    /// Mathematics teacher.
    MathTeacher,
}

impl AgentType {
    /// Returns the wire code for this agent type.
    pub fn code(self) -> &'static str {
        match self {
            Self::Default => "DEFAULT",
            Self::ChineseTeacher => "CHINESE_TEACHER",
            Self::MathTeacher => "MATH_TEACHER",
        }
    }

    /// Returns the human-readable label stored alongside the agent.
    pub fn type_name(self) -> &'static str {
        match self {
            Self::Default => "通用智能体",
            Self::ChineseTeacher => "语文老师",
            Self::MathTeacher => "数学老师",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Returned when an agent type code is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown agent type: {0}")]
pub struct UnknownAgentType(pub String);

impl FromStr for AgentType {
    type Err = UnknownAgentType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEFAULT" => Ok(Self::Default),
            "CHINESE_TEACHER" => Ok(Self::ChineseTeacher),
            "MATH_TEACHER" => Ok(Self::MathTeacher),
            other => Err(UnknownAgentType(other.to_string())),
        }
    }
}

/// A named persona that conversations are bound to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    /// Role prompt handed to the answer engine.
    pub role: String,
    pub agent_type: AgentType,
    pub type_name: String,
    /// Unix timestamp in seconds.
    pub created_at: f64,
    #[serde(default)]
    pub has_knowledge_base: bool,
}

/// Author of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    /// Unix timestamp in seconds.
    pub timestamp: f64,
    /// Set on assistant turns that were answered by a different agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded: Option<bool>,
}

impl Turn {
    /// Creates a user turn stamped with the current time.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: unix_now(),
            forwarded: None,
        }
    }

    /// Creates an assistant turn stamped with the current time.
    pub fn assistant(content: impl Into<String>, forwarded: bool) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: unix_now(),
            forwarded: Some(forwarded),
        }
    }
}

/// Conversation metadata persisted next to the turn list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationInfo {
    pub agent_id: String,
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default = "unix_now")]
    pub created_at: f64,
}

fn default_title() -> String {
    "新对话".to_string()
}

/// A conversation as stored: identity, metadata and ordered turns.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRecord {
    pub id: String,
    pub info: ConversationInfo,
    pub turns: Vec<Turn>,
}

impl ConversationRecord {
    /// Creates an empty conversation for `agent` with the default title.
    pub fn new(agent: &Agent) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            info: ConversationInfo {
                agent_id: agent.id.clone(),
                title: format!("与 {} 的对话", agent.name),
                created_at: unix_now(),
            },
            turns: Vec::new(),
        }
    }
}

/// Current time as fractional unix seconds.
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_type_round_trip() {
        for ty in [
            AgentType::Default,
            AgentType::ChineseTeacher,
            AgentType::MathTeacher,
        ] {
            assert_eq!(ty.code().parse::<AgentType>(), Ok(ty));
            let json = serde_json::to_string(&ty).unwrap();
            assert_eq!(json, format!("\"{}\"", ty.code()));
        }
    }

    #[test]
    fn agent_type_invalid() {
        assert_eq!(
            "PHYSICS_TEACHER".parse::<AgentType>(),
            Err(UnknownAgentType("PHYSICS_TEACHER".to_string()))
        );
    }

    #[test]
    fn user_turn_omits_forwarded_flag() {
        let json = serde_json::to_value(Turn::user("你好")).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "你好");
        assert!(json.get("forwarded").is_none());
    }

    #[test]
    fn assistant_turn_carries_forwarded_flag() {
        let json = serde_json::to_value(Turn::assistant("答案", true)).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["forwarded"], true);
    }

    #[test]
    fn conversation_info_defaults_missing_fields() {
        let info: ConversationInfo = serde_json::from_str(r#"{"agent_id":"a1"}"#).unwrap();
        assert_eq!(info.agent_id, "a1");
        assert_eq!(info.title, "新对话");
        assert!(info.created_at > 0.0);
    }
}
