//! Engine error types

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the engine
///
/// The scheduler prefers local recovery (skip the failing source, keep the
/// session alive); errors that reach callers come from the command boundary
/// and from offline rendering.
#[derive(Error, Debug)]
pub enum EngineError {
    /// An id referenced by an update or delete does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Uuid },

    /// Audio fetch or decode failed; the affected source drops out of the mix
    #[error("decode failed: {0}")]
    DecodeFailure(String),

    /// A per-source audio sink could not be initialized
    #[error("sink init failed: {0}")]
    SinkInit(String),

    /// An input was torn down while an iterator was still reading from it
    #[error("source disposed")]
    Disposed,

    /// A command violated a data-model invariant and was rejected
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// The audio graph refused an operation
    #[error("graph error: {0}")]
    Graph(String),

    /// Persisted project could not be read or written
    #[error("persistence error: {0}")]
    Persist(String),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: Uuid) -> Self {
        EngineError::NotFound { kind, id }
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        EngineError::Invariant(msg.into())
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
