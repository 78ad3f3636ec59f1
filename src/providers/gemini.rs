//! Google Gemini (Generative Language REST API) adapter.

use super::sse::event_stream;
use super::{
    build_http_client, check_status, estimate_tokens, normalize_role, EmbeddingRequest,
    EmbeddingResponse, KeyPool, LLMRequest, LLMResponse, LLMStream, Provider, ProviderError,
    ProviderResult, StreamItem, TokenUsage,
};
use crate::core::config::{KeyConfig, ProviderConfig, ProviderType};
use crate::store::SharedStore;
use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::StreamExt;
use serde_json::{json, Map, Value};

const API_VERSION: &str = "v1beta";

pub struct GeminiProvider {
    id: String,
    base_url: String,
    default_model: Option<String>,
    static_models: Vec<String>,
    client: reqwest::Client,
    pool: KeyPool,
}

impl GeminiProvider {
    pub fn new(config: &ProviderConfig, store: SharedStore) -> ProviderResult<Self> {
        let base_url = config.base_url().ok_or_else(|| {
            ProviderError::InvalidRequest(format!("provider '{}' requires base_url", config.id))
        })?;
        Ok(Self {
            id: config.id.clone(),
            base_url,
            default_model: config.model.clone(),
            static_models: config.models.clone(),
            client: build_http_client(config.timeout_secs())?,
            pool: KeyPool::new(&config.id, &config.keys, store),
        })
    }

    fn model_for(&self, requested: Option<&str>) -> ProviderResult<String> {
        let model = requested
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .or_else(|| self.default_model.clone())
            .ok_or_else(|| ProviderError::InvalidRequest(format!("no model specified for provider '{}'", self.id)))?;
        Ok(model.trim_start_matches("models/").to_string())
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        format!("{}/{}/models/{}:{}", self.base_url, API_VERSION, model, method)
    }

    async fn post(&self, key: &KeyConfig, url: &str, body: &Value) -> ProviderResult<reqwest::Response> {
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &key.secret)
            .json(body)
            .send()
            .await?;
        check_status(response).await
    }
}

/// `contents` plus optional `systemInstruction`. Gemini names the assistant
/// role `model` and only accepts alternating turns.
fn generate_body(request: &LLMRequest) -> ProviderResult<Value> {
    let mut system_parts: Vec<Value> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();

    for message in request.conversation() {
        let role = match normalize_role(&message.role) {
            "system" => {
                system_parts.push(json!({"text": message.content}));
                continue;
            }
            "assistant" => "model",
            _ => "user",
        };
        let part = json!({"text": message.content});
        match contents.last_mut() {
            Some(last) if last["role"] == role => {
                if let Some(parts) = last["parts"].as_array_mut() {
                    parts.push(part);
                }
            }
            _ => contents.push(json!({"role": role, "parts": [part]})),
        }
    }
    if contents.is_empty() {
        return Err(ProviderError::InvalidRequest(
            "at least one user or assistant message is required".into(),
        ));
    }

    let mut generation = Map::new();
    if let Some(max_tokens) = request.max_tokens {
        generation.insert("maxOutputTokens".into(), json!(max_tokens));
    }
    if let Some(temperature) = request.param_f64("temperature") {
        generation.insert("temperature".into(), json!(temperature));
    }
    if let Some(top_p) = request.param_f64("top_p") {
        generation.insert("topP".into(), json!(top_p));
    }
    match request.params.get("stop") {
        Some(Value::String(s)) => {
            generation.insert("stopSequences".into(), json!([s]));
        }
        Some(stops @ Value::Array(_)) => {
            generation.insert("stopSequences".into(), stops.clone());
        }
        _ => {}
    }

    let mut body = json!({"contents": contents});
    if !system_parts.is_empty() {
        body["systemInstruction"] = json!({"parts": system_parts});
    }
    if !generation.is_empty() {
        body["generationConfig"] = Value::Object(generation);
    }
    Ok(body)
}

fn candidate_text(chunk: &Value) -> String {
    chunk
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default()
}

fn finish_reason(chunk: &Value) -> Option<String> {
    chunk
        .pointer("/candidates/0/finishReason")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn usage_counts(chunk: &Value) -> (Option<u64>, Option<u64>) {
    let usage = chunk.get("usageMetadata");
    (
        usage
            .and_then(|u| u.get("promptTokenCount"))
            .and_then(Value::as_u64),
        usage
            .and_then(|u| u.get("candidatesTokenCount"))
            .and_then(Value::as_u64),
    )
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        &self.id
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Gemini
    }

    async fn generate(&self, request: &LLMRequest) -> ProviderResult<LLMResponse> {
        let body = generate_body(request)?;
        let url = self.model_url(&self.model_for(request.model.as_deref())?, "generateContent");
        self.pool
            .execute(request.preferred_key.as_deref(), |key| {
                let (body, url) = (&body, &url);
                async move {
                    let raw: Value = self.post(&key, url, body).await?.json().await?;
                    if raw.pointer("/candidates/0").is_none() {
                        let reason = raw
                            .pointer("/promptFeedback/blockReason")
                            .and_then(Value::as_str)
                            .unwrap_or("no candidates");
                        return Err(ProviderError::Protocol(format!("response has no candidates: {}", reason)));
                    }
                    let (input, output) = usage_counts(&raw);
                    Ok(LLMResponse::from_parts(
                        request,
                        candidate_text(&raw),
                        input,
                        output,
                        finish_reason(&raw),
                        &key.id,
                    ))
                }
            })
            .await
    }

    async fn generate_stream(&self, request: &LLMRequest) -> ProviderResult<LLMStream> {
        let body = generate_body(request)?;
        let url = format!(
            "{}?alt=sse",
            self.model_url(&self.model_for(request.model.as_deref())?, "streamGenerateContent")
        );
        let (key_id, response) = self
            .pool
            .execute(request.preferred_key.as_deref(), |key| {
                let (body, url) = (&body, &url);
                async move {
                    let response = self.post(&key, url, body).await?;
                    Ok((key.id.clone(), response))
                }
            })
            .await?;

        let mut events = event_stream(response);
        let items = try_stream! {
            while let Some(event) = events.next().await {
                let event = event?;
                let Some(data) = event.data.as_deref() else { continue };
                let chunk: Value = serde_json::from_str(data)
                    .map_err(|e| ProviderError::Protocol(format!("invalid stream chunk: {}", e)))?;
                let usage = match usage_counts(&chunk) {
                    (None, None) => None,
                    (input, output) => Some(TokenUsage {
                        input_tokens: input.unwrap_or(0),
                        output_tokens: output.unwrap_or(0),
                    }),
                };
                yield StreamItem {
                    text: candidate_text(&chunk),
                    finish_reason: finish_reason(&chunk),
                    usage,
                    done: false,
                };
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
                        .get(format!("{}/{}/models", self.base_url, API_VERSION))
                        .header("x-goog-api-key", &key.secret)
                        .send()
                        .await?,
                )
                .await?
                .json()
                .await?;
                Ok(body
                    .get("models")
                    .and_then(Value::as_array)
                    .map(|models| {
                        models
                            .iter()
                            .filter_map(|m| m.get("name").and_then(Value::as_str))
                            .map(|name| name.trim_start_matches("models/").to_string())
                            .collect()
                    })
                    .unwrap_or_default())
            })
            .await
    }

    async fn create_embeddings(&self, request: &EmbeddingRequest) -> ProviderResult<EmbeddingResponse> {
        if request.input.is_empty() {
            return Err(ProviderError::InvalidRequest("input must not be empty".into()));
        }
        let model = self.model_for(request.model.as_deref())?;
        let requests: Vec<Value> = request
            .input
            .iter()
            .map(|text| {
                let mut item = json!({
                    "model": format!("models/{}", model),
                    "content": {"parts": [{"text": text}]},
                });
                if let Some(dimensions) = request.dimensions {
                    item["outputDimensionality"] = json!(dimensions);
                }
                item
            })
            .collect();
        let body = json!({"requests": requests});
        let url = self.model_url(&model, "batchEmbedContents");
        let estimated = request.input.iter().map(|t| estimate_tokens(t.len())).sum::<u64>();

        self.pool
            .execute(request.preferred_key.as_deref(), |key| {
                let (body, url) = (&body, &url);
                async move {
                    let raw: Value = self.post(&key, url, body).await?.json().await?;
                    let embeddings = raw
                        .get("embeddings")
                        .and_then(Value::as_array)
                        .ok_or_else(|| ProviderError::Protocol("embeddings response has no embeddings".into()))?
                        .iter()
                        .map(|e| {
                            e.get("values")
                                .and_then(Value::as_array)
                                .and_then(|values| {
                                    values
                                        .iter()
                                        .map(|v| v.as_f64().map(|f| f as f32))
                                        .collect::<Option<Vec<f32>>>()
                                })
                                .ok_or_else(|| ProviderError::Protocol("malformed embedding values".into()))
                        })
                        .collect::<ProviderResult<Vec<_>>>()?;
                    Ok(EmbeddingResponse {
                        embeddings,
                        prompt_tokens: estimated,
                        total_tokens: estimated,
                        key_id: key.id.clone(),
                    })
                }
            })
            .await
    }
}
