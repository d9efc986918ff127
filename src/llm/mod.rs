//! LM client layer: provider trait, registry, retry, pricing.

use std::sync::Arc;

use async_trait::async_trait;

pub mod error;
pub mod pricing;
pub mod provider;
pub mod retry;
pub mod types;

pub use error::LlmError;
pub use pricing::PricingTable;
pub use provider::{AnthropicConfig, AnthropicProvider, OpenAiConfig, OpenAiProvider};
pub use retry::{call_with_retry, RetryPolicy};
pub use types::{ChatMessage, ChatRole, CompletionRequest, CompletionResponse};

/// A chat-completion backend. Returns the completion text together with the
/// provider-reported token counts.
#[async_trait]
pub trait LmProvider: Send + Sync {
    fn id(&self) -> &str;

    /// Whether this provider serves the given model name.
    fn handles(&self, model: &str) -> bool;

    fn default_model(&self) -> &str;

    async fn complete(&self, request: CompletionRequest)
        -> Result<CompletionResponse, LlmError>;
}

/// Routes completion requests to the provider that claims the model name.
/// Registration order is the routing priority.
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn LmProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    pub fn register(&mut self, provider: Arc<dyn LmProvider>) {
        self.providers.push(provider);
    }

    pub fn get_for_model(&self, model: &str) -> Result<Arc<dyn LmProvider>, LlmError> {
        self.providers
            .iter()
            .find(|p| p.handles(model))
            .cloned()
            .ok_or_else(|| LlmError::ProviderNotFound(model.to_string()))
    }

    /// Build from environment variables. Anthropic is registered first so
    /// `claude-*` models route to it; the OpenAI-compatible provider handles
    /// everything else.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        if let Ok(api_key) = std::env::var("ANTHROPIC_API_KEY") {
            let base_url = std::env::var("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|_| "https://api.anthropic.com/v1".into());
            reg.register(Arc::new(AnthropicProvider::new(AnthropicConfig {
                api_key,
                base_url,
                default_model: "claude-3-5-sonnet-20241022".into(),
            })));
        }
        if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
            let base_url = std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".into());
            reg.register(Arc::new(OpenAiProvider::new(OpenAiConfig {
                api_key,
                base_url,
                default_model: "gpt-4o".into(),
            })));
        }
        reg
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
