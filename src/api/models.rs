//! API request and response models.
//!
//! OpenAI-compatible shapes for chat completions, embeddings and model
//! listings, plus the health and error bodies.

use crate::providers::{ChatMessage, EmbeddingRequest, LLMRequest, TUNING_PARAMS};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use utoipa::ToSchema;

/// Chat completion request following OpenAI API format.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "model": "gpt-4o",
    "messages": [
        {"role": "system", "content": "You are a helpful assistant."},
        {"role": "user", "content": "Hello!"}
    ],
    "temperature": 0.7,
    "max_tokens": 1000,
    "stream": false
}))]
pub struct ChatCompletionRequest {
    /// Client-facing model name or alias
    pub model: String,

    /// Conversation messages
    #[serde(default)]
    pub messages: Vec<Message>,

    /// Bare prompt, used when `messages` is empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Sampling temperature (0.0 to 2.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,

    /// Whether to stream the response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    /// Additional provider-specific parameters
    #[serde(flatten)]
    #[schema(additional_properties)]
    pub extra: HashMap<String, Value>,
}

impl ChatCompletionRequest {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// Normalised request for the adapter. Only recognised tuning fields are
    /// forwarded.
    pub fn to_llm_request(&self, upstream_model: &str, preferred_key: &str) -> LLMRequest {
        let mut params = Map::new();
        if let Some(temperature) = self.temperature {
            params.insert("temperature".into(), Value::from(temperature));
        }
        if let Some(top_p) = self.top_p {
            params.insert("top_p".into(), Value::from(top_p));
        }
        for name in TUNING_PARAMS {
            if let Some(value) = self.extra.get(*name).filter(|v| !v.is_null()) {
                params.entry(name.to_string()).or_insert_with(|| value.clone());
            }
        }

        LLMRequest {
            prompt: self.prompt.clone(),
            messages: self
                .messages
                .iter()
                .map(|m| ChatMessage::new(m.role.clone(), m.text()))
                .collect(),
            model: Some(upstream_model.to_string()),
            max_tokens: self.max_tokens,
            params,
            preferred_key: Some(preferred_key.to_string()),
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({"role": "user", "content": "Hello!"}))]
pub struct Message {
    /// Role: "system", "user" or "assistant"; anything unrecognised is sent as "user"
    #[serde(default = "default_role", deserialize_with = "lenient_role")]
    pub role: String,

    #[serde(default)]
    pub content: Option<MessageContent>,
}

impl Message {
    pub fn text(&self) -> String {
        self.content.as_ref().map(MessageContent::text).unwrap_or_default()
    }
}

fn default_role() -> String {
    "user".to_string()
}

/// Accepts any JSON value; non-strings degrade to `user`.
fn lenient_role<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(role) => role,
        _ => default_role(),
    })
}

/// Plain text or an array of typed parts; only text parts are kept.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub part_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Chat completion response (schema only; the upstream body is passed through).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "id": "chatcmpl-abc123",
    "object": "chat.completion",
    "created": 1677858242,
    "model": "gpt-4o",
    "choices": [{
        "index": 0,
        "message": {"role": "assistant", "content": "Hello! How can I help you today?"},
        "finish_reason": "stop"
    }],
    "usage": {"prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30}
}))]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Choice {
    pub index: u32,
    pub message: ResponseMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ResponseMessage {
    pub role: String,
    pub content: String,
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({"prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30}))]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Streaming response chunk.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StreamChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<StreamChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StreamChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

/// Delta content in streaming responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Embeddings request following OpenAI API format.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({"model": "text-embedding-3-small", "input": ["hello", "world"]}))]
pub struct EmbeddingsRequest {
    pub model: String,
    pub input: EmbeddingInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Only `float` is produced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum EmbeddingInput {
    Single(String),
    Many(Vec<String>),
}

impl EmbeddingInput {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            EmbeddingInput::Single(text) => vec![text],
            EmbeddingInput::Many(texts) => texts,
        }
    }
}

impl EmbeddingsRequest {
    /// False for no strings or only empty strings.
    pub fn has_input(&self) -> bool {
        match &self.input {
            EmbeddingInput::Single(text) => !text.is_empty(),
            EmbeddingInput::Many(texts) => texts.iter().any(|t| !t.is_empty()),
        }
    }

    pub fn to_embedding_request(&self, upstream_model: &str, preferred_key: &str) -> EmbeddingRequest {
        EmbeddingRequest {
            input: self.input.clone().into_vec(),
            model: Some(upstream_model.to_string()),
            dimensions: self.dimensions,
            user: self.user.clone(),
            preferred_key: Some(preferred_key.to_string()),
        }
    }
}

/// Embeddings response (schema only).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EmbeddingsResponse {
    pub object: String,
    pub data: Vec<EmbeddingData>,
    pub model: String,
    pub usage: EmbeddingUsage,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EmbeddingData {
    pub object: String,
    pub embedding: Vec<f32>,
    pub index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EmbeddingUsage {
    pub prompt_tokens: u64,
    pub total_tokens: u64,
}

/// Model information.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({"id": "gpt-4o", "object": "model", "created": 1700000000, "owned_by": "llm-gateway"}))]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

/// List of available models.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({"status": "ok", "version": "0.1.0", "providers": 2, "store": "memory"}))]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub providers: usize,
    pub store: String,
}

/// OpenAI-shaped error body.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiErrorResponse {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_malformed_role_degrades_to_user() {
        let request: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [{"role": 42, "content": "hi"}, {"content": "no role"}]
        }))
        .unwrap();
        assert_eq!(request.messages[0].role, "user");
        assert_eq!(request.messages[1].role, "user");
    }

    #[test]
    fn test_content_parts_are_flattened() {
        let message: Message = serde_json::from_value(json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "first"},
                {"type": "image_url"},
                {"type": "text", "text": "second"}
            ]
        }))
        .unwrap();
        assert_eq!(message.text(), "first\nsecond");
    }

    #[test]
    fn test_only_tuning_params_are_forwarded() {
        let request: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.2,
            "seed": 7,
            "logit_bias": {"1": 2},
            "max_tokens": 64
        }))
        .unwrap();
        let llm = request.to_llm_request("gpt-4o-2024", "k1");
        assert_eq!(llm.model.as_deref(), Some("gpt-4o-2024"));
        assert_eq!(llm.preferred_key.as_deref(), Some("k1"));
        assert_eq!(llm.max_tokens, Some(64));
        assert_eq!(llm.params.get("temperature"), Some(&json!(0.2)));
        assert_eq!(llm.params.get("seed"), Some(&json!(7)));
        assert!(!llm.params.contains_key("logit_bias"));
    }

    #[test]
    fn test_embedding_input_shapes() {
        let single: EmbeddingsRequest =
            serde_json::from_value(json!({"model": "m", "input": "hello"})).unwrap();
        assert!(single.has_input());
        assert_eq!(single.to_embedding_request("m", "k").input, vec!["hello"]);

        let many: EmbeddingsRequest =
            serde_json::from_value(json!({"model": "m", "input": ["a", "b"], "dimensions": 256})).unwrap();
        let request = many.to_embedding_request("up", "k2");
        assert_eq!(request.input.len(), 2);
        assert_eq!(request.dimensions, Some(256));
        assert_eq!(request.model.as_deref(), Some("up"));

        let empty: EmbeddingsRequest =
            serde_json::from_value(json!({"model": "m", "input": []})).unwrap();
        assert!(!empty.has_input());

        let blank: EmbeddingsRequest =
            serde_json::from_value(json!({"model": "m", "input": ""})).unwrap();
        assert!(!blank.has_input());
    }
}
