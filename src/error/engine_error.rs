//! Top-level engine errors.

use thiserror::Error;

use super::ErrorKind;
use crate::llm::LlmError;
use crate::sandbox::SandboxError;

/// Errors surfaced by the orchestrator entry points.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Context too large: {size} chars exceeds limit of {limit}")]
    ContextTooLarge { size: usize, limit: usize },
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("No provider registered for model: {0}")]
    NoProvider(String),
    #[error("Execution failed: {kind}: {message}")]
    ExecutionFailed { kind: ErrorKind, message: String },
    #[error("LM provider error: {0}")]
    Provider(#[from] LlmError),
    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// The taxonomy bucket this error falls into.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::ContextTooLarge { .. } => ErrorKind::ContextTooLarge,
            EngineError::ExecutionFailed { kind, .. } => *kind,
            EngineError::Provider(_) => ErrorKind::ProviderError,
            EngineError::Sandbox(e) => e.kind(),
            _ => ErrorKind::ProgramRuntimeError,
        }
    }
}
