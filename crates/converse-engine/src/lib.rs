//! Answer engine binding for Converse.
//!
//! An [`EngineBinder`] turns a role prompt, a knowledge index and the prior
//! turns of a conversation into an [`AnswerEngine`]: a stateful handle that
//! answers follow-up questions either whole or as a lazy stream of text
//! fragments. The engine keeps its own conversational memory, seeded from
//! the turns it was bound with and extended after every completed answer.
//!
//! The crate also carries the knowledge collaborators the binder consumes:
//! a plain-text document loader and splitter, and a lexical term-vector
//! index persisted per agent.

pub mod completions;
pub mod documents;
pub mod error;
pub mod knowledge;
pub mod memory;

pub use completions::{ChatCompletionsBinder, ChatCompletionsEngine, LlmConfig};
pub use documents::{load_documents, split_documents, Document};
pub use error::EngineError;
pub use knowledge::{Chunk, KnowledgeIndex, KnowledgeLibrary};
pub use memory::ConversationMemory;

use async_trait::async_trait;
use converse_types::Turn;
use futures_util::stream::BoxStream;
use std::sync::Arc;

/// Lazy, finite, forward-only sequence of answer fragments. The complete
/// answer is the concatenation of every `Ok` item.
pub type FragmentStream = BoxStream<'static, Result<String, EngineError>>;

/// Role prompt used when an agent was created without one.
pub const DEFAULT_ROLE_PROMPT: &str = "你是一个有用的AI助手。";

/// Stateful answering handle bound to one conversation.
#[async_trait]
pub trait AnswerEngine: Send + Sync {
    /// Answers `question` in one piece.
    async fn answer(&self, question: &str) -> Result<String, EngineError>;

    /// Answers `question` incrementally. The exchange is added to the
    /// engine's memory only once the stream has been consumed to the end.
    async fn answer_streaming(&self, question: &str) -> Result<FragmentStream, EngineError>;

    /// Number of messages currently held in the engine's memory.
    fn memory_len(&self) -> usize;
}

/// Constructs answer engines.
#[async_trait]
pub trait EngineBinder: Send + Sync {
    /// Binds a new engine. `knowledge` may be [`KnowledgeIndex::empty`];
    /// an agent without documents still gets a working engine.
    async fn bind(
        &self,
        role_prompt: &str,
        knowledge: Arc<KnowledgeIndex>,
        prior_turns: &[Turn],
    ) -> Result<Arc<dyn AnswerEngine>, EngineError>;
}
