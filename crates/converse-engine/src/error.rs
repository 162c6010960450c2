use thiserror::Error;

/// Errors raised while binding or running an answer engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine could not be constructed.
    #[error("engine binding failed: {0}")]
    Binding(String),

    /// Answer generation failed, possibly mid-stream.
    #[error("answer generation failed: {0}")]
    Answer(String),

    /// A knowledge index or document set could not be read or written.
    #[error("knowledge base error: {0}")]
    Knowledge(String),

    /// The collaborator did not respond in time.
    #[error("engine call timed out after {0} seconds")]
    Timeout(u64),
}
