//! Conversation pipeline for Converse.
//!
//! [`ChatService`] owns the conversation store, the agent registry and the
//! live voice sessions, and runs every answer through one pipeline whichever
//! channel it is delivered on: a single reply, a server-sent event stream
//! with synthesized audio chunks, or pushes on a live voice connection.

pub mod agents;
pub mod assembler;
pub mod error;
pub mod routing;
pub mod service;
pub mod sink;
pub mod store;
pub mod tasks;
pub mod voice_session;

pub use agents::{AgentRegistry, NewAgent, Upload, ALLOWED_EXTENSIONS};
pub use assembler::{ChunkPolicy, SpeechChunker, StreamAssembler};
pub use error::ChatError;
pub use service::{ChatService, ChatSettings, Collaborators};
pub use sink::LiveSink;
pub use store::{
    BoundEngine, ConversationDetail, ConversationGuard, ConversationStore, ConversationSummary,
    EngineState, MemoryStatus,
};
pub use tasks::BackgroundTasks;
pub use voice_session::{ClosedSession, EndedSession, FragmentOutcome, VoiceSessions};
