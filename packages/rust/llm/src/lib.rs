//! LLM completion and embedding clients for Postforge.
//!
//! The pipeline only sees the [`LlmClient`] and [`Embedder`] traits. The
//! concrete [`OpenAiCompatClient`] talks to any OpenAI-compatible API
//! (OpenRouter by default). Model output is returned verbatim; callers are
//! responsible for validating it.

mod types;

use std::time::Duration;

use async_trait::async_trait;
use postforge_shared::{LlmConfig, PostforgeError, Result};
use reqwest::Client;
use tracing::{debug, warn};

use crate::types::{ChatMessage, ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse};

/// User-Agent string for LLM requests.
const USER_AGENT: &str = concat!("Postforge/", env!("CARGO_PKG_VERSION"));

const DEFAULT_TEMPERATURE: f32 = 0.7;
const DEFAULT_MAX_TOKENS: u32 = 2000;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// One system + user turn sent to a chat model.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// A chat completion service.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Return the raw text of the first choice.
    async fn complete(&self, request: CompletionRequest) -> Result<String>;
}

/// A text embedding service.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

// ---------------------------------------------------------------------------
// OpenAI-compatible client
// ---------------------------------------------------------------------------

/// HTTP client for `/chat/completions` and `/embeddings`.
#[derive(Clone)]
pub struct OpenAiCompatClient {
    http: Client,
    api_key: String,
    base_url: String,
    chat_model: String,
    embedding_model: String,
}

impl OpenAiCompatClient {
    /// Build a client from the `[llm]` config section and a resolved API key.
    pub fn from_config(config: &LlmConfig, api_key: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PostforgeError::Llm(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            chat_model: config.chat_model.clone(),
            embedding_model: config.embedding_model.clone(),
        })
    }

    /// Point the client at a different API root (proxies, test servers).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn chat_model(&self) -> &str {
        &self.chat_model
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let start = std::time::Instant::now();
        let body = ChatRequest {
            model: &self.chat_model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "completion request failed");
                PostforgeError::Llm(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!(%status, error = %error_text, "completion API error");
            return Err(PostforgeError::Llm(format!(
                "completion API returned {status}: {error_text}"
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| PostforgeError::Llm(format!("unreadable completion response: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| PostforgeError::Llm("completion returned no content".into()))?;

        debug!(
            model = %self.chat_model,
            prompt_chars = request.prompt.len(),
            response_chars = content.len(),
            duration_ms = start.elapsed().as_millis(),
            "chat completion"
        );
        Ok(content)
    }
}

#[async_trait]
impl Embedder for OpenAiCompatClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = EmbeddingRequest {
            model: &self.embedding_model,
            input: text,
        };

        let response = self
            .http
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "embedding request failed");
                PostforgeError::Llm(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!(%status, error = %error_text, "embedding API error");
            return Err(PostforgeError::Llm(format!(
                "embedding API returned {status}: {error_text}"
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| PostforgeError::Llm(format!("unreadable embedding response: {e}")))?;

        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| PostforgeError::Llm("embedding response had no vector".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> OpenAiCompatClient {
        OpenAiCompatClient::from_config(&LlmConfig::default(), "sk-test")
            .expect("build client")
            .with_base_url(server.uri())
    }

    #[test]
    fn base_url_is_normalized() {
        let client = OpenAiCompatClient::from_config(&LlmConfig::default(), "k")
            .expect("build client")
            .with_base_url("http://localhost:9999/v1/");
        assert_eq!(client.base_url(), "http://localhost:9999/v1");
        assert_eq!(client.chat_model(), "anthropic/claude-sonnet-4.5");
    }

    #[tokio::test]
    async fn complete_reads_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "{\"topic\": \"x\"}"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let text = client_for(&server)
            .complete(CompletionRequest::new("sys", "user").with_temperature(0.2))
            .await
            .expect("completion");
        assert_eq!(text, r#"{"topic": "x"}"#);
    }

    #[tokio::test]
    async fn complete_surfaces_api_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .complete(CompletionRequest::new("sys", "user"))
            .await
            .expect_err("429 must fail");
        assert!(matches!(err, PostforgeError::Llm(_)));
        assert!(err.to_string().contains("slow down"));
    }

    #[tokio::test]
    async fn complete_rejects_empty_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": []
            })))
            .mount(&server)
            .await;

        let result = client_for(&server)
            .complete(CompletionRequest::new("sys", "user"))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn embed_returns_first_vector() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"embedding": [0.1, 0.2, 0.3], "index": 0}]
            })))
            .mount(&server)
            .await;

        let vector = client_for(&server).embed("cintilla").await.expect("embed");
        assert_eq!(vector, vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn embed_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        assert!(client_for(&server).embed("x").await.is_err());
    }
}
