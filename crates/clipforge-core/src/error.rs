//! ClipForge Error Definitions
//!
//! Defines error types used throughout the engine.

use thiserror::Error;

use super::ClipId;

/// Errors surfaced by a background task.
///
/// `ResourceGone` and `Canceled` unwind silently; the remaining variants
/// are reported to the user, either before any subprocess is spawned
/// (`ExternalToolMissing`, `InvalidParameters`) or after the fact with
/// captured log text (`ExternalToolCrashed`, `EmptyOutput`). No variant
/// is retried automatically.
#[derive(Error, Debug)]
pub enum TaskError {
    // =========================================================================
    // Silent unwinds
    // =========================================================================
    #[error("Clip {0} was deleted while the task was in flight")]
    ResourceGone(ClipId),

    #[error("Task canceled")]
    Canceled,

    // =========================================================================
    // Reported before any work begins
    // =========================================================================
    #[error("Required tool not found: {0}")]
    ExternalToolMissing(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    // =========================================================================
    // Reported after the fact, with captured log
    // =========================================================================
    #[error("External process crashed: {message}")]
    ExternalToolCrashed { message: String, log: String },

    #[error("Process produced an empty output file: {0}")]
    EmptyOutput(String),

    // =========================================================================
    // Infrastructure
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TaskError {
    /// Whether this error unwinds without any user-facing message.
    pub fn is_silent(&self) -> bool {
        matches!(self, TaskError::ResourceGone(_) | TaskError::Canceled)
    }

    /// Captured subprocess log attached to the error, if any.
    pub fn log_details(&self) -> Option<&str> {
        match self {
            TaskError::ExternalToolCrashed { log, .. } if !log.is_empty() => Some(log),
            _ => None,
        }
    }
}

/// Engine result type
pub type TaskResult<T> = Result<T, TaskError>;
