use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Provider not found for model: {0}")]
    ProviderNotFound(String),

    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    #[error("Rate limit exceeded: retry after {retry_after:?}s")]
    RateLimitExceeded { retry_after: Option<u64> },

    #[error("API error ({status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl LlmError {
    /// Errors worth retrying: connection-level failures, server errors,
    /// and rate limits.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::NetworkError(_) | LlmError::RateLimitExceeded { .. } => true,
            LlmError::ApiError { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
