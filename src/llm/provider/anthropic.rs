use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::Value;

use async_trait::async_trait;

use crate::llm::error::LlmError;
use crate::llm::types::{ChatRole, CompletionRequest, CompletionResponse};
use crate::llm::LmProvider;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub base_url: String,
    pub default_model: String,
}

/// Provider for Anthropic-compatible messages endpoints.
pub struct AnthropicProvider {
    config: AnthropicConfig,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn build_headers(&self) -> Result<HeaderMap, LlmError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.config.api_key)
                .map_err(|e| LlmError::InvalidRequest(e.to_string()))?,
        );
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// The messages API takes the system prompt as a top-level field, not a
    /// message.
    fn build_payload(&self, request: &CompletionRequest) -> Value {
        let mut system = String::new();
        let messages = request
            .messages
            .iter()
            .filter_map(|m| match m.role {
                ChatRole::System => {
                    if !system.is_empty() {
                        system.push('\n');
                    }
                    system.push_str(&m.content);
                    None
                }
                ChatRole::User => Some(serde_json::json!({
                    "role": "user",
                    "content": m.content,
                })),
                ChatRole::Assistant => Some(serde_json::json!({
                    "role": "assistant",
                    "content": m.content,
                })),
            })
            .collect::<Vec<_>>();

        let mut payload = serde_json::json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });
        if !system.is_empty() {
            payload["system"] = Value::String(system);
        }
        if let Some(temp) = request.temperature {
            payload["temperature"] = Value::Number(serde_json::Number::from_f64(temp).unwrap());
        }
        payload
    }

    fn parse_response(body: &Value) -> Result<CompletionResponse, LlmError> {
        let content = body
            .get("content")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .and_then(|c| c.get("text"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let model = body
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        let usage = body.get("usage").cloned().unwrap_or(Value::Null);
        let input_tokens = usage
            .get("input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let output_tokens = usage
            .get("output_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        Ok(CompletionResponse {
            content,
            model,
            input_tokens,
            output_tokens,
        })
    }

    fn map_error(status: u16, body: &str) -> LlmError {
        if status == 401 || status == 403 {
            return LlmError::AuthenticationError(body.to_string());
        }
        if status == 429 {
            return LlmError::RateLimitExceeded { retry_after: None };
        }
        LlmError::ApiError {
            status,
            message: body.to_string(),
        }
    }
}

#[async_trait]
impl LmProvider for AnthropicProvider {
    fn id(&self) -> &str {
        "anthropic"
    }

    fn handles(&self, model: &str) -> bool {
        model.starts_with("claude")
    }

    fn default_model(&self) -> &str {
        &self.config.default_model
    }

    async fn complete(
        &self,
        mut request: CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        if request.model.is_empty() {
            request.model = self.config.default_model.clone();
        }

        let headers = self.build_headers()?;
        let url = format!("{}/messages", self.config.base_url.trim_end_matches('/'));
        let payload = self.build_payload(&request);

        let response = self
            .client
            .post(url)
            .headers(headers)
            .json(&payload)
            .send()
            .await
            .map_err(|e| LlmError::NetworkError(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| LlmError::NetworkError(e.to_string()))?;

        if !status.is_success() {
            return Err(Self::map_error(status.as_u16(), &text));
        }

        let body: Value = serde_json::from_str(&text)
            .map_err(|e| LlmError::SerializationError(e.to_string()))?;
        Self::parse_response(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::ChatMessage;
    use mockito::Server;

    fn base_config(base_url: String) -> AnthropicConfig {
        AnthropicConfig {
            api_key: "test-key".into(),
            base_url,
            default_model: "claude-3-5-sonnet-20241022".into(),
        }
    }

    #[tokio::test]
    async fn test_anthropic_completion() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/messages")
            .match_header("x-api-key", "test-key")
            .match_header("anthropic-version", ANTHROPIC_VERSION)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                "model": "claude-3-5-sonnet-20241022",
                "content": [{"type": "text", "text": "hello"}],
                "usage": {"input_tokens": 7, "output_tokens": 4}
            }"#,
            )
            .create_async()
            .await;

        let provider = AnthropicProvider::new(base_config(server.url()));
        let resp = provider
            .complete(CompletionRequest {
                model: "claude-3-5-sonnet-20241022".into(),
                messages: vec![ChatMessage::system("sys"), ChatMessage::user("hi")],
                temperature: Some(0.5),
                max_tokens: None,
            })
            .await
            .unwrap();
        assert_eq!(resp.content, "hello");
        assert_eq!(resp.input_tokens, 7);
        assert_eq!(resp.output_tokens, 4);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_system_messages_lifted_to_field() {
        let provider = AnthropicProvider::new(base_config("http://unused".into()));
        let payload = provider.build_payload(&CompletionRequest {
            model: "claude-3-haiku-20240307".into(),
            messages: vec![
                ChatMessage::system("you are terse"),
                ChatMessage::user("hi"),
            ],
            temperature: None,
            max_tokens: Some(128),
        });
        assert_eq!(payload["system"], "you are terse");
        assert_eq!(payload["max_tokens"], 128);
        let messages = payload["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
    }

    #[tokio::test]
    async fn test_handles_claude_models_only() {
        let provider = AnthropicProvider::new(base_config("http://unused".into()));
        assert!(provider.handles("claude-3-opus-20240229"));
        assert!(!provider.handles("gpt-4o"));
    }

    #[tokio::test]
    async fn test_anthropic_error_mapping() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/messages")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let provider = AnthropicProvider::new(base_config(server.url()));
        let err = provider
            .complete(CompletionRequest {
                model: "claude-3-haiku-20240307".into(),
                messages: vec![ChatMessage::user("hi")],
                temperature: None,
                max_tokens: None,
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
