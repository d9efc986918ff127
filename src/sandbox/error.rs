use thiserror::Error;

use crate::error::ErrorKind;

/// Errors raised while executing a program in the sandbox.
#[derive(Debug, Clone, Error)]
pub enum SandboxError {
    #[error("Forbidden name: {name}")]
    Violation { name: String },
    #[error("Syntax error at line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("Runtime error at line {line}: {message}")]
    Runtime { line: usize, message: String },
    #[error("Execution timed out")]
    Timeout,
    #[error("{kind}: {message}")]
    Host { kind: ErrorKind, message: String },
}

impl SandboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::Violation { .. } | SandboxError::Syntax { .. } => {
                ErrorKind::SandboxViolation
            }
            SandboxError::Runtime { .. } => ErrorKind::ProgramRuntimeError,
            SandboxError::Timeout => ErrorKind::DeadlineExceeded,
            SandboxError::Host { kind, .. } => *kind,
        }
    }
}

/// Convenience alias for sandbox-level results.
pub type SandboxResult<T> = Result<T, SandboxError>;
