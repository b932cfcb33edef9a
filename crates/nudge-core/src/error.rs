use crate::task::TaskStatus;
use thiserror::Error;

/// Top-level error type for Nudge.
#[derive(Debug, Error)]
pub enum NudgeError {
    /// Error from the natural-language parsing backend.
    #[error("parser error: {0}")]
    Parser(String),

    /// Error from a messaging channel.
    #[error("channel error: {0}")]
    Channel(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Task store error.
    #[error("store error: {0}")]
    Store(String),

    /// Calendar mirror error.
    #[error("calendar error: {0}")]
    Calendar(String),

    /// Request authentication or ownership failure.
    #[error("auth error: {0}")]
    Auth(String),

    /// A referenced task or user does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested event is not legal from the task's current status.
    #[error("invalid transition: cannot {event} a {from} task")]
    InvalidTransition {
        from: TaskStatus,
        event: &'static str,
    },

    /// The request is well-formed but asks for something out of bounds.
    #[error("rejected: {0}")]
    Rejected(String),

    /// A concurrent writer changed the task and a retry did not settle it.
    #[error("conflict: {0}")]
    Conflict(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
