use serde::{Deserialize, Serialize};

/// Failure bucket propagated on nodes and executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Program referenced a forbidden name or used blocked syntax.
    SandboxViolation,
    /// Program raised an error during execution.
    ProgramRuntimeError,
    /// LM call failed after retries.
    ProviderError,
    /// `llm_query` called past the configured depth.
    RecursionLimit,
    /// Wall-clock deadline expired.
    DeadlineExceeded,
    /// Input exceeded the configured context size.
    ContextTooLarge,
    /// Root program completed without calling `FINAL`.
    NoFinal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SandboxViolation => "sandbox_violation",
            ErrorKind::ProgramRuntimeError => "program_runtime_error",
            ErrorKind::ProviderError => "provider_error",
            ErrorKind::RecursionLimit => "recursion_limit",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::ContextTooLarge => "context_too_large",
            ErrorKind::NoFinal => "no_final",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
