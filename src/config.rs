//! Engine configuration and limits.

use std::time::Duration;

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Limits and defaults for the orchestrator.
///
/// Treated as immutable after construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Executions with a larger context are rejected at entry.
    pub max_context_size: usize,
    /// Advisory chunk size handed to the root LM in its system prompt.
    pub default_chunk_size: usize,
    /// Cap enforced in `llm_query`; root depth is 0.
    pub max_recursion_depth: usize,
    /// `llm_query` prompts larger than this are handled by a recursive
    /// sub-agent (which generates its own program) instead of a single
    /// completion.
    pub recursion_threshold: usize,
    /// Global wall-clock deadline per execution.
    pub execution_timeout: Duration,
    /// Per-child-call cap, bounded further by the remaining deadline.
    pub child_call_timeout: Duration,
    /// Model used when the caller omits one.
    pub default_model: String,
    /// Total LM attempts per call (1 initial + retries).
    pub llm_max_attempts: u32,
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to the
    /// documented defaults.
    pub fn from_env() -> Self {
        Self {
            max_context_size: env_usize("MAX_CONTEXT_SIZE", 500_000),
            default_chunk_size: env_usize("DEFAULT_CHUNK_SIZE", 50_000),
            max_recursion_depth: env_usize("MAX_RECURSION_DEPTH", 10),
            recursion_threshold: env_usize("RECURSION_THRESHOLD", 100_000),
            execution_timeout: Duration::from_secs(env_u64("EXECUTION_TIMEOUT", 300)),
            child_call_timeout: Duration::from_secs(env_u64("CHILD_CALL_TIMEOUT", 120)),
            default_model: std::env::var("DEFAULT_MODEL")
                .unwrap_or_else(|_| "gpt-4o".to_string()),
            llm_max_attempts: env_u64("LLM_MAX_ATTEMPTS", 3) as u32,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_context_size: 500_000,
            default_chunk_size: 50_000,
            max_recursion_depth: 10,
            recursion_threshold: 100_000,
            execution_timeout: Duration::from_secs(300),
            child_call_timeout: Duration::from_secs(120),
            default_model: "gpt-4o".to_string(),
            llm_max_attempts: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_context_size, 500_000);
        assert_eq!(config.default_chunk_size, 50_000);
        assert_eq!(config.max_recursion_depth, 10);
        assert_eq!(config.recursion_threshold, 100_000);
        assert_eq!(config.execution_timeout, Duration::from_secs(300));
        assert_eq!(config.llm_max_attempts, 3);
    }
}
