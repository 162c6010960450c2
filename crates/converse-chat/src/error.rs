use converse_engine::EngineError;
use converse_store::StoreError;
use converse_voice::VoiceError;
use thiserror::Error;

/// Errors surfaced by the conversation pipeline.
#[derive(Debug, Error)]
pub enum ChatError {
    /// No answer engine could be bound for the conversation.
    #[error("could not load the answer engine: {0}")]
    Binding(String),

    /// The engine failed while answering.
    #[error("failed to get a reply: {0}")]
    Answer(String),

    #[error("speech synthesis failed: {0}")]
    Synthesis(String),

    /// An intent was detected but no agent can take the message.
    #[error("routing failed: {0}")]
    Routing(String),

    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("no active voice session")]
    SessionNotFound,
}

impl From<StoreError> for ChatError {
    fn from(e: StoreError) -> Self {
        Self::Persistence(e.to_string())
    }
}

impl From<EngineError> for ChatError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Binding(msg) | EngineError::Knowledge(msg) => Self::Binding(msg),
            EngineError::Answer(msg) => Self::Answer(msg),
            timeout @ EngineError::Timeout(_) => Self::Answer(timeout.to_string()),
        }
    }
}

impl From<VoiceError> for ChatError {
    fn from(e: VoiceError) -> Self {
        Self::Synthesis(e.to_string())
    }
}

impl From<tokio::task::JoinError> for ChatError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Persistence(format!("background task failed: {}", e))
    }
}
