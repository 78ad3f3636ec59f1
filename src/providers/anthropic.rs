//! Anthropic Messages API adapter.

use super::sse::event_stream;
use super::{
    build_http_client, check_status, normalize_role, KeyPool, LLMRequest, LLMResponse, LLMStream,
    Provider, ProviderError, ProviderResult, StreamItem, TokenUsage,
};
use crate::core::config::{KeyConfig, ProviderConfig, ProviderType};
use crate::store::SharedStore;
use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

pub struct AnthropicProvider {
    id: String,
    base_url: String,
    default_model: Option<String>,
    static_models: Vec<String>,
    client: reqwest::Client,
    pool: KeyPool,
}

/// Hoist system turns into the top-level `system` field and merge
/// consecutive same-role turns, which the Messages API rejects.
fn split_system(request: &LLMRequest) -> (Option<String>, Vec<AnthropicMessage>) {
    let mut system_parts = Vec::new();
    let mut messages: Vec<AnthropicMessage> = Vec::new();

    for message in request.conversation() {
        let role = match normalize_role(&message.role) {
            "system" => {
                system_parts.push(message.content);
                continue;
            }
            "assistant" => "assistant",
            _ => "user",
        };
        match messages.last_mut() {
            Some(last) if last.role == role => {
                last.content.push_str("\n\n");
                last.content.push_str(&message.content);
            }
            _ => messages.push(AnthropicMessage {
                role,
                content: message.content,
            }),
        }
    }

    let system = (!system_parts.is_empty()).then(|| system_parts.join("\n\n"));
    (system, messages)
}

impl AnthropicProvider {
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

    fn build_request(&self, request: &LLMRequest, stream: bool) -> ProviderResult<MessagesRequest> {
        let model = request
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .or_else(|| self.default_model.clone())
            .ok_or_else(|| ProviderError::InvalidRequest(format!("no model specified for provider '{}'", self.id)))?;

        let (system, messages) = split_system(request);
        if messages.is_empty() {
            return Err(ProviderError::InvalidRequest(
                "at least one user or assistant message is required".into(),
            ));
        }

        let stop_sequences = match request.params.get("stop") {
            Some(Value::String(s)) => Some(vec![s.clone()]),
            Some(Value::Array(items)) => Some(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            ),
            _ => None,
        };

        Ok(MessagesRequest {
            model,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system,
            messages,
            temperature: request.param_f64("temperature"),
            top_p: request.param_f64("top_p"),
            stop_sequences,
            stream,
        })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder, key: &KeyConfig) -> reqwest::RequestBuilder {
        builder
            .header("x-api-key", &key.secret)
            .header("anthropic-version", ANTHROPIC_VERSION)
    }

    async fn send_messages(&self, key: &KeyConfig, body: &MessagesRequest) -> ProviderResult<reqwest::Response> {
        let builder = self.client.post(format!("{}/v1/messages", self.base_url));
        let response = self.authorized(builder, key).json(body).send().await?;
        check_status(response).await
    }
}

fn parse_stream_event(event_type: &str, data: &Value) -> Option<StreamItem> {
    match event_type {
        "message_start" => {
            let input = data.pointer("/message/usage/input_tokens").and_then(Value::as_u64)?;
            Some(StreamItem {
                usage: Some(TokenUsage {
                    input_tokens: input,
                    output_tokens: 0,
                }),
                ..Default::default()
            })
        }
        "content_block_delta" => {
            let text = data.pointer("/delta/text").and_then(Value::as_str)?;
            Some(StreamItem {
                text: text.to_string(),
                ..Default::default()
            })
        }
        "message_delta" => Some(StreamItem {
            finish_reason: data
                .pointer("/delta/stop_reason")
                .and_then(Value::as_str)
                .map(str::to_string),
            usage: data
                .pointer("/usage/output_tokens")
                .and_then(Value::as_u64)
                .map(|output| TokenUsage {
                    input_tokens: 0,
                    output_tokens: output,
                }),
            ..Default::default()
        }),
        _ => None,
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.id
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Anthropic
    }

    async fn generate(&self, request: &LLMRequest) -> ProviderResult<LLMResponse> {
        let body = self.build_request(request, false)?;
        self.pool
            .execute(request.preferred_key.as_deref(), |key| {
                let body = &body;
                async move {
                    let parsed: MessagesResponse =
                        self.send_messages(&key, body).await?.json().await?;
                    let text: String = parsed
                        .content
                        .iter()
                        .filter(|b| b.block_type == "text")
                        .filter_map(|b| b.text.as_deref())
                        .collect();
                    if parsed.content.is_empty() {
                        return Err(ProviderError::Protocol("response has no content".into()));
                    }
                    let usage = parsed.usage.unwrap_or_default();
                    Ok(LLMResponse::from_parts(
                        request,
                        text,
                        usage.input_tokens,
                        usage.output_tokens,
                        parsed.stop_reason,
                        &key.id,
                    ))
                }
            })
            .await
    }

    async fn generate_stream(&self, request: &LLMRequest) -> ProviderResult<LLMStream> {
        let body = self.build_request(request, true)?;
        let (key_id, response) = self
            .pool
            .execute(request.preferred_key.as_deref(), |key| {
                let body = &body;
                async move {
                    let response = self.send_messages(&key, body).await?;
                    Ok((key.id.clone(), response))
                }
            })
            .await?;

        let mut events = event_stream(response);
        let items = try_stream! {
            while let Some(event) = events.next().await {
                let event = event?;
                let Some(data) = event.data.as_deref() else { continue };
                let data: Value = serde_json::from_str(data)
                    .map_err(|e| ProviderError::Protocol(format!("invalid stream event: {}", e)))?;
                let event_type = event
                    .event
                    .clone()
                    .or_else(|| data.get("type").and_then(Value::as_str).map(str::to_string))
                    .unwrap_or_default();
                if event_type == "error" {
                    let message = data
                        .pointer("/error/message")
                        .and_then(Value::as_str)
                        .unwrap_or("stream error")
                        .to_string();
                    Err(ProviderError::Protocol(message))?;
                }
                if event_type == "message_stop" {
                    break;
                }
                if let Some(item) = parse_stream_event(&event_type, &data) {
                    yield item;
                }
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
                let builder = self.client.get(format!("{}/v1/models", self.base_url));
                let body: Value = check_status(self.authorized(builder, &key).send().await?)
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ChatMessage, EmbeddingRequest};
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> AnthropicProvider {
        let config = ProviderConfig {
            id: "anthropic".into(),
            provider_type: ProviderType::Anthropic,
            base_url: Some(server.uri()),
            model: Some("claude-3-sonnet".into()),
            timeout_secs: Some(5),
            models: vec![],
            keys: vec![KeyConfig {
                id: "a1".into(),
                secret: "sk-ant".into(),
                ..Default::default()
            }],
        };
        AnthropicProvider::new(&config, Arc::new(MemoryStore::new())).unwrap()
    }

    #[test]
    fn test_system_hoisted_and_turns_merged() {
        let request = LLMRequest {
            messages: vec![
                ChatMessage::new("system", "be brief"),
                ChatMessage::new("user", "a"),
                ChatMessage::new("tool", "b"),
                ChatMessage::new("assistant", "c"),
            ],
            ..Default::default()
        };
        let (system, messages) = split_system(&request);
        assert_eq!(system.as_deref(), Some("be brief"));
        assert_eq!(
            messages,
            vec![
                AnthropicMessage { role: "user", content: "a\n\nb".into() },
                AnthropicMessage { role: "assistant", content: "c".into() },
            ]
        );
    }

    #[tokio::test]
    async fn test_generate_maps_messages_api() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-ant"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .and(body_partial_json(json!({
                "model": "claude-3-sonnet",
                "system": "sys",
                "max_tokens": 1024,
                "messages": [{"role": "user", "content": "Hello"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_1",
                "type": "message",
                "role": "assistant",
                "content": [{"type": "text", "text": "Hi"}, {"type": "text", "text": "!"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 11, "output_tokens": 2}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let request = LLMRequest {
            messages: vec![ChatMessage::new("system", "sys"), ChatMessage::new("user", "Hello")],
            ..Default::default()
        };
        let response = provider(&server).generate(&request).await.unwrap();
        assert_eq!(response.text, "Hi!");
        assert_eq!(response.input_tokens, 11);
        assert_eq!(response.tokens_used, 13);
        assert_eq!(response.finish_reason.as_deref(), Some("end_turn"));
        assert!(response.raw.is_none());

        let body = response.to_openai_body("claude-sonnet");
        assert_eq!(body["choices"][0]["message"]["role"], "assistant");
        assert_eq!(body["model"], "claude-sonnet");
    }

    #[tokio::test]
    async fn test_stream_events() {
        let server = MockServer::start().await;
        let sse = concat!(
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":7}}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n",
            "event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":1}}\n\n",
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"
        );
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let request = LLMRequest {
            prompt: Some("hey".into()),
            ..Default::default()
        };
        let items: Vec<StreamItem> = provider(&server)
            .generate_stream(&request)
            .await
            .unwrap()
            .items
            .map(|i| i.unwrap())
            .collect()
            .await;

        assert_eq!(items.len(), 4);
        assert_eq!(items[0].usage.unwrap().input_tokens, 7);
        assert_eq!(items[1].text, "Hi");
        assert_eq!(items[2].finish_reason.as_deref(), Some("end_turn"));
        assert!(items[3].done);
    }

    #[tokio::test]
    async fn test_embeddings_unsupported() {
        let server = MockServer::start().await;
        let err = provider(&server)
            .create_embeddings(&EmbeddingRequest {
                input: vec!["x".into()],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unsupported { .. }));
    }
}
