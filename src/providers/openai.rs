//! OpenAI-compatible upstreams: OpenAI, Mistral, Together, OpenRouter,
//! HuggingFace router, Grok and custom endpoints all speak `/chat/completions`,
//! `/embeddings` and `/models` with bearer auth.

use super::sse::event_stream;
use super::{
    build_http_client, check_status, normalize_role, EmbeddingRequest, EmbeddingResponse,
    KeyPool, LLMRequest, LLMResponse, LLMStream, Provider, ProviderError, ProviderResult,
    StreamItem, TokenUsage, TUNING_PARAMS,
};
use crate::core::config::{KeyConfig, ProviderConfig, ProviderType};
use crate::store::SharedStore;
use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::StreamExt;
use serde_json::{json, Map, Value};
use std::sync::Arc;

pub struct OpenAiCompatibleProvider {
    id: String,
    provider_type: ProviderType,
    base_url: String,
    default_model: Option<String>,
    static_models: Vec<String>,
    client: reqwest::Client,
    pool: KeyPool,
}

impl OpenAiCompatibleProvider {
    pub fn new(config: &ProviderConfig, store: SharedStore) -> ProviderResult<Self> {
        let base_url = config.base_url().ok_or_else(|| {
            ProviderError::InvalidRequest(format!("provider '{}' requires base_url", config.id))
        })?;
        Ok(Self {
            id: config.id.clone(),
            provider_type: config.provider_type,
            base_url,
            default_model: config.model.clone(),
            static_models: config.models.clone(),
            client: build_http_client(config.timeout_secs())?,
            pool: KeyPool::new(&config.id, &config.keys, store),
        })
    }

    fn model_for(&self, requested: Option<&str>) -> ProviderResult<String> {
        requested
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .or_else(|| self.default_model.clone())
            .ok_or_else(|| ProviderError::InvalidRequest(format!("no model specified for provider '{}'", self.id)))
    }

    fn chat_body(&self, request: &LLMRequest, stream: bool) -> ProviderResult<Value> {
        let messages: Vec<Value> = request
            .conversation()
            .iter()
            .map(|m| json!({"role": normalize_role(&m.role), "content": m.content}))
            .collect();
        if messages.is_empty() {
            return Err(ProviderError::InvalidRequest("messages must not be empty".into()));
        }

        let mut body = Map::new();
        body.insert("model".into(), json!(self.model_for(request.model.as_deref())?));
        body.insert("messages".into(), Value::Array(messages));
        if let Some(max_tokens) = request.max_tokens {
            body.insert("max_tokens".into(), json!(max_tokens));
        }
        for name in TUNING_PARAMS {
            if let Some(value) = request.params.get(*name) {
                body.insert((*name).to_string(), value.clone());
            }
        }
        if stream {
            body.insert("stream".into(), json!(true));
            if self.provider_type == ProviderType::Openai {
                body.insert("stream_options".into(), json!({"include_usage": true}));
            }
        }
        Ok(Value::Object(body))
    }

    async fn post(&self, key: &KeyConfig, path: &str, body: &Value) -> ProviderResult<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&key.secret)
            .json(body)
            .send()
            .await?;
        check_status(response).await
    }

    async fn chat_once(
        &self,
        key: Arc<KeyConfig>,
        request: &LLMRequest,
        body: &Value,
    ) -> ProviderResult<LLMResponse> {
        let raw: Value = self
            .post(&key, "/chat/completions", body)
            .await?
            .json()
            .await?;
        parse_chat_completion(request, raw, &key.id)
    }
}

/// Normalise an OpenAI `chat.completion` body, keeping it as the raw passthrough.
pub(crate) fn parse_chat_completion(
    request: &LLMRequest,
    raw: Value,
    key_id: &str,
) -> ProviderResult<LLMResponse> {
    let choice = raw
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .ok_or_else(|| ProviderError::Protocol("response has no choices".into()))?;

    let text = choice
        .pointer("/message/content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .map(str::to_string);
    let usage = raw.get("usage");
    let input = usage.and_then(|u| u.get("prompt_tokens")).and_then(Value::as_u64);
    let output = usage
        .and_then(|u| u.get("completion_tokens"))
        .and_then(Value::as_u64);

    let mut response = LLMResponse::from_parts(request, text, input, output, finish_reason, key_id);
    response.raw = Some(raw);
    Ok(response)
}

/// One streamed `chat.completion.chunk` as a [`StreamItem`].
fn parse_chunk(data: &str) -> ProviderResult<StreamItem> {
    let chunk: Value = serde_json::from_str(data)
        .map_err(|e| ProviderError::Protocol(format!("invalid stream chunk: {}", e)))?;
    let choice = chunk.pointer("/choices/0");
    let usage = chunk.get("usage").filter(|u| !u.is_null()).map(|u| TokenUsage {
        input_tokens: u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
        output_tokens: u.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0),
    });
    Ok(StreamItem {
        text: choice
            .and_then(|c| c.pointer("/delta/content"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        finish_reason: choice
            .and_then(|c| c.get("finish_reason"))
            .and_then(Value::as_str)
            .map(str::to_string),
        usage,
        done: false,
    })
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.id
    }

    fn provider_type(&self) -> ProviderType {
        self.provider_type
    }

    async fn generate(&self, request: &LLMRequest) -> ProviderResult<LLMResponse> {
        let body = self.chat_body(request, false)?;
        self.pool
            .execute(request.preferred_key.as_deref(), |key| {
                self.chat_once(key, request, &body)
            })
            .await
    }

    async fn generate_stream(&self, request: &LLMRequest) -> ProviderResult<LLMStream> {
        let body = self.chat_body(request, true)?;
        let (key_id, response) = self
            .pool
            .execute(request.preferred_key.as_deref(), |key| {
                let body = &body;
                async move {
                    let response = self.post(&key, "/chat/completions", body).await?;
                    Ok((key.id.clone(), response))
                }
            })
            .await?;

        let mut events = event_stream(response);
        let items = try_stream! {
            while let Some(event) = events.next().await {
                let event = event?;
                if event.is_done() {
                    break;
                }
                let Some(data) = event.data.as_deref() else { continue };
                yield parse_chunk(data)?;
            }
            yield StreamItem { done: true, ..Default::default() };
        };

        Ok(LLMStream {
            key_id,
            items: items.boxed(),
        })
    }

    async fn list_models(&self) -> ProviderResult<Vec<String>> {
        if !self.static_models.is_empty() {
            return Ok(self.static_models.clone());
        }
        self.pool
            .execute(None, |key| async move {
                let body: Value = check_status(
                    self.client
                        .get(format!("{}/models", self.base_url))
                        .bearer_auth(&key.secret)
                        .send()
                        .await?,
                )
                .await?
                .json()
                .await?;
                Ok(body
                    .get("data")
                    .and_then(Value::as_array)
                    .map(|models| {
                        models
                            .iter()
                            .filter_map(|m| m.get("id").and_then(Value::as_str))
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default())
            })
            .await
    }

    async fn create_embeddings(&self, request: &EmbeddingRequest) -> ProviderResult<EmbeddingResponse> {
        if self.provider_type == ProviderType::Grok {
            return Err(ProviderError::unsupported(&self.id, "embeddings"));
        }
        if request.input.is_empty() {
            return Err(ProviderError::InvalidRequest("input must not be empty".into()));
        }

        let mut body = json!({
            "model": self.model_for(request.model.as_deref())?,
            "input": request.input,
        });
        if let Some(dimensions) = request.dimensions {
            body["dimensions"] = json!(dimensions);
        }
        if let Some(user) = &request.user {
            body["user"] = json!(user);
        }

        self.pool
            .execute(request.preferred_key.as_deref(), |key| {
                let body = &body;
                async move {
                    let raw: Value = self.post(&key, "/embeddings", body).await?.json().await?;
                    parse_embeddings(&raw, &key.id)
                }
            })
            .await
    }
}

/// Normalise an OpenAI-style embeddings list (also used by Voyage).
pub(crate) fn parse_embeddings(raw: &Value, key_id: &str) -> ProviderResult<EmbeddingResponse> {
    let data = raw
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::Protocol("embeddings response has no data".into()))?;

    let mut indexed: Vec<(u64, Vec<f32>)> = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let vector = item
            .get("embedding")
            .and_then(Value::as_array)
            .ok_or_else(|| ProviderError::Protocol("embedding item without vector".into()))?
            .iter()
            .map(|v| v.as_f64().map(|f| f as f32))
            .collect::<Option<Vec<f32>>>()
            .ok_or_else(|| ProviderError::Protocol("non-numeric embedding value".into()))?;
        let index = item
            .get("index")
            .and_then(Value::as_u64)
            .unwrap_or(position as u64);
        indexed.push((index, vector));
    }
    indexed.sort_by_key(|(index, _)| *index);

    let usage = raw.get("usage");
    let prompt_tokens = usage
        .and_then(|u| u.get("prompt_tokens").or_else(|| u.get("total_tokens")))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let total_tokens = usage
        .and_then(|u| u.get("total_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(prompt_tokens);

    Ok(EmbeddingResponse {
        embeddings: indexed.into_iter().map(|(_, v)| v).collect(),
        prompt_tokens,
        total_tokens,
        key_id: key_id.to_string(),
    })
}
