//! Upstream provider adapters.
//!
//! Every adapter implements [`Provider`]: a normalised request goes in, the
//! adapter translates it to the upstream's wire format, calls it with one of
//! the provider's keys (rotating through the [`KeyPool`] on failure) and
//! normalises the answer into an [`LLMResponse`].

pub mod anthropic;
pub mod cohere;
pub mod gemini;
pub mod key_pool;
pub mod openai;
pub mod replicate;
pub mod sse;
pub mod voyage;

use crate::core::config::ProviderType;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use thiserror::Error;

pub use self::anthropic::AnthropicProvider;
pub use self::cohere::CohereProvider;
pub use self::gemini::GeminiProvider;
pub use self::key_pool::{KeyPool, MAX_ATTEMPTS};
pub use self::openai::OpenAiCompatibleProvider;
pub use self::replicate::ReplicateProvider;
pub use self::voyage::VoyageProvider;

/// Upstream parameters forwarded from the client body when present.
pub const TUNING_PARAMS: &[&str] = &[
    "temperature",
    "top_p",
    "stop",
    "presence_penalty",
    "frequency_penalty",
    "seed",
    "n",
    "user",
];

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("no API key available for provider '{0}'")]
    NoKeyAvailable(String),

    #[error("{provider} does not support {capability}")]
    Unsupported {
        provider: String,
        capability: &'static str,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("upstream returned {status}: {message}")]
    Http { status: u16, message: String },

    #[error("malformed upstream response: {0}")]
    Protocol(String),

    #[error("upstream unreachable: {0}")]
    Transport(String),

    #[error("upstream timed out: {0}")]
    Timeout(String),

    #[error("{provider} API error after {attempts} attempts: {last}")]
    Exhausted {
        provider: String,
        attempts: u32,
        last: Box<ProviderError>,
    },
}

impl ProviderError {
    pub fn is_transport(&self) -> bool {
        matches!(self, ProviderError::Transport(_) | ProviderError::Timeout(_))
    }

    /// Failures raised before any upstream call; another key cannot help.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            ProviderError::Unsupported { .. }
                | ProviderError::InvalidRequest(_)
                | ProviderError::NoKeyAvailable(_)
        )
    }

    pub fn unsupported(provider: &str, capability: &'static str) -> Self {
        ProviderError::Unsupported {
            provider: provider.to_string(),
            capability,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(err.to_string())
        } else if err.is_decode() {
            ProviderError::Protocol(err.to_string())
        } else if let Some(status) = err.status() {
            ProviderError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            ProviderError::Transport(err.to_string())
        }
    }
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Role vocabulary shared by OpenAI-style upstreams; anything else degrades to `user`.
pub fn normalize_role(role: &str) -> &'static str {
    match role {
        "system" | "developer" => "system",
        "assistant" => "assistant",
        _ => "user",
    }
}

/// Normalised generation request.
#[derive(Debug, Clone, Default)]
pub struct LLMRequest {
    pub prompt: Option<String>,
    pub messages: Vec<ChatMessage>,
    /// Upstream model override; adapters fall back to their default model
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub params: Map<String, Value>,
    /// Key chosen by the selector, tried on the first attempt
    pub preferred_key: Option<String>,
}

impl LLMRequest {
    /// Messages take precedence over the prompt; a lone prompt becomes one user turn.
    pub fn conversation(&self) -> Vec<ChatMessage> {
        if !self.messages.is_empty() {
            return self.messages.clone();
        }
        match &self.prompt {
            Some(prompt) => vec![ChatMessage::new("user", prompt.clone())],
            None => Vec::new(),
        }
    }

    pub fn param_f64(&self, name: &str) -> Option<f64> {
        self.params.get(name).and_then(Value::as_f64)
    }

    fn input_text_len(&self) -> usize {
        self.conversation().iter().map(|m| m.content.len()).sum()
    }
}

/// Rough token count for upstreams that do not report usage.
pub fn estimate_tokens(text_len: usize) -> u64 {
    (text_len / 4) as u64
}

/// Normalised generation result.
#[derive(Debug, Clone, PartialEq)]
pub struct LLMResponse {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tokens_used: u64,
    pub finish_reason: Option<String>,
    /// Key that served the call
    pub key_id: String,
    pub status: u16,
    /// Upstream body when it is already an OpenAI `chat.completion`
    pub raw: Option<Value>,
}

impl LLMResponse {
    /// Builds a response, estimating token counts the upstream left out.
    pub fn from_parts(
        request: &LLMRequest,
        text: String,
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
        finish_reason: Option<String>,
        key_id: &str,
    ) -> Self {
        let input_tokens = input_tokens.unwrap_or_else(|| estimate_tokens(request.input_text_len()));
        let output_tokens = output_tokens.unwrap_or_else(|| estimate_tokens(text.len()));
        Self {
            text,
            input_tokens,
            output_tokens,
            tokens_used: input_tokens + output_tokens,
            finish_reason,
            key_id: key_id.to_string(),
            status: 200,
            raw: None,
        }
    }

    /// Body returned to the client: the raw upstream JSON when present,
    /// otherwise a `chat.completion` built from the normalised fields.
    pub fn to_openai_body(&self, model: &str) -> Value {
        if let Some(raw) = &self.raw {
            return raw.clone();
        }
        json!({
            "id": format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            "object": "chat.completion",
            "created": chrono::Utc::now().timestamp(),
            "model": model,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": self.text},
                "finish_reason": self.finish_reason.as_deref().unwrap_or("stop"),
            }],
            "usage": {
                "prompt_tokens": self.input_tokens,
                "completion_tokens": self.output_tokens,
                "total_tokens": self.tokens_used,
            }
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Fold in a partial report. Some upstreams send prompt and completion
    /// counts in separate events, each leaving the other side at zero.
    pub fn merge(&mut self, other: TokenUsage) {
        self.input_tokens = self.input_tokens.max(other.input_tokens);
        self.output_tokens = self.output_tokens.max(other.output_tokens);
    }
}

/// One increment of a streamed generation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamItem {
    pub text: String,
    pub finish_reason: Option<String>,
    /// Usage reported by the upstream, usually on the last chunk
    pub usage: Option<TokenUsage>,
    pub done: bool,
}

/// Streamed generation bound to the key that opened it.
pub struct LLMStream {
    pub key_id: String,
    pub items: BoxStream<'static, ProviderResult<StreamItem>>,
}

impl LLMStream {
    /// One-item stream for upstreams without native streaming.
    pub fn from_response(response: LLMResponse) -> Self {
        let item = StreamItem {
            text: response.text,
            finish_reason: response.finish_reason,
            usage: Some(TokenUsage {
                input_tokens: response.input_tokens,
                output_tokens: response.output_tokens,
            }),
            done: true,
        };
        Self {
            key_id: response.key_id,
            items: stream::once(async move { Ok(item) }).boxed(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EmbeddingRequest {
    pub input: Vec<String>,
    pub model: Option<String>,
    pub dimensions: Option<u32>,
    pub user: Option<String>,
    pub preferred_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingResponse {
    /// Indexed parallel to the request input
    pub embeddings: Vec<Vec<f32>>,
    pub prompt_tokens: u64,
    pub total_tokens: u64,
    pub key_id: String,
}

impl EmbeddingResponse {
    pub fn to_openai_body(&self, model: &str) -> Value {
        let data: Vec<Value> = self
            .embeddings
            .iter()
            .enumerate()
            .map(|(index, embedding)| {
                json!({"object": "embedding", "embedding": embedding, "index": index})
            })
            .collect();
        json!({
            "object": "list",
            "data": data,
            "model": model,
            "usage": {"prompt_tokens": self.prompt_tokens, "total_tokens": self.total_tokens}
        })
    }
}

/// Capability set every upstream adapter implements.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider id from configuration.
    fn name(&self) -> &str;

    fn provider_type(&self) -> ProviderType;

    async fn generate(&self, request: &LLMRequest) -> ProviderResult<LLMResponse>;

    async fn list_models(&self) -> ProviderResult<Vec<String>>;

    async fn generate_stream(&self, request: &LLMRequest) -> ProviderResult<LLMStream> {
        let response = self.generate(request).await?;
        Ok(LLMStream::from_response(response))
    }

    async fn create_embeddings(&self, _request: &EmbeddingRequest) -> ProviderResult<EmbeddingResponse> {
        Err(ProviderError::unsupported(self.name(), "embeddings"))
    }
}

/// Long-lived HTTP client shared by all calls of one adapter.
pub(crate) fn build_http_client(timeout_secs: u64) -> ProviderResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .map_err(|e| ProviderError::InvalidRequest(format!("failed to build HTTP client: {}", e)))
}

/// Turn a non-2xx upstream answer into [`ProviderError::Http`], keeping the
/// upstream's own error message when it sent one.
pub(crate) async fn check_status(response: reqwest::Response) -> ProviderResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    Err(ProviderError::Http {
        status: status.as_u16(),
        message: upstream_error_message(&text),
    })
}

const MAX_ERROR_MESSAGE_LEN: usize = 500;

pub(crate) fn upstream_error_message(body: &str) -> String {
    let from_json = serde_json::from_str::<Value>(body).ok().and_then(|v| {
        v.pointer("/error/message")
            .or_else(|| v.get("message"))
            .or_else(|| v.get("detail"))
            .or_else(|| v.get("error"))
            .and_then(|m| m.as_str().map(str::to_string))
    });
    let mut message = from_json.unwrap_or_else(|| body.trim().to_string());
    if message.len() > MAX_ERROR_MESSAGE_LEN {
        let mut cut = MAX_ERROR_MESSAGE_LEN;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
        message.push_str("...");
    }
    message
}
