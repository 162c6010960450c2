use thiserror::Error;

/// Errors produced by the repositories.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem access failed.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored document could not be encoded or decoded.
    #[error("storage JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The identifier cannot be used as a storage key.
    #[error("invalid record id: {0:?}")]
    InvalidId(String),

    /// A lock guarding in-memory state was poisoned.
    #[error("storage lock poisoned")]
    Poisoned,
}
