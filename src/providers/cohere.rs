//! Cohere adapter. Only the v2 embed endpoint is exposed through the gateway.

use super::{
    build_http_client, check_status, estimate_tokens, EmbeddingRequest, EmbeddingResponse,
    KeyPool, LLMRequest, LLMResponse, Provider, ProviderError, ProviderResult,
};
use crate::core::config::{ProviderConfig, ProviderType};
use crate::store::SharedStore;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

const DEFAULT_INPUT_TYPE: &str = "search_document";

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: EmbedVectors,
    #[serde(default)]
    meta: Option<EmbedMeta>,
}

#[derive(Debug, Deserialize)]
struct EmbedVectors {
    float: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct EmbedMeta {
    #[serde(default)]
    billed_units: Option<BilledUnits>,
}

#[derive(Debug, Deserialize)]
struct BilledUnits {
    #[serde(default)]
    input_tokens: Option<u64>,
}

pub struct CohereProvider {
    id: String,
    base_url: String,
    default_model: Option<String>,
    static_models: Vec<String>,
    client: reqwest::Client,
    pool: KeyPool,
}

impl CohereProvider {
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
}

#[async_trait]
impl Provider for CohereProvider {
    fn name(&self) -> &str {
        &self.id
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Cohere
    }

    async fn generate(&self, _request: &LLMRequest) -> ProviderResult<LLMResponse> {
        Err(ProviderError::unsupported(&self.id, "chat completions"))
    }

    async fn list_models(&self) -> ProviderResult<Vec<String>> {
        if !self.static_models.is_empty() {
            return Ok(self.static_models.clone());
        }
        self.pool
            .execute(None, |key| async move {
                let body: Value = check_status(
                    self.client
                        .get(format!("{}/v1/models", self.base_url))
                        .query(&[("endpoint", "embed")])
                        .bearer_auth(&key.secret)
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
                            .map(str::to_string)
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
        let model = request
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .or_else(|| self.default_model.clone())
            .ok_or_else(|| ProviderError::InvalidRequest(format!("no model specified for provider '{}'", self.id)))?;

        let mut body = json!({
            "model": model,
            "texts": request.input,
            "input_type": DEFAULT_INPUT_TYPE,
            "embedding_types": ["float"],
        });
        if let Some(dimensions) = request.dimensions {
            body["output_dimension"] = json!(dimensions);
        }
        let estimated = request.input.iter().map(|t| estimate_tokens(t.len())).sum::<u64>();

        self.pool
            .execute(request.preferred_key.as_deref(), |key| {
                let body = &body;
                async move {
                    let response = self
                        .client
                        .post(format!("{}/v2/embed", self.base_url))
                        .bearer_auth(&key.secret)
                        .json(body)
                        .send()
                        .await?;
                    let parsed: EmbedResponse = check_status(response).await?.json().await?;
                    let tokens = parsed
                        .meta
                        .and_then(|m| m.billed_units)
                        .and_then(|b| b.input_tokens)
                        .unwrap_or(estimated);
                    Ok(EmbeddingResponse {
                        embeddings: parsed.embeddings.float,
                        prompt_tokens: tokens,
                        total_tokens: tokens,
                        key_id: key.id.clone(),
                    })
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::KeyConfig;
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> CohereProvider {
        let config = ProviderConfig {
            id: "cohere".into(),
            provider_type: ProviderType::Cohere,
            base_url: Some(server.uri()),
            model: Some("embed-english-v3.0".into()),
            timeout_secs: Some(5),
            models: vec![],
            keys: vec![KeyConfig {
                id: "c1".into(),
                secret: "co-key".into(),
                ..Default::default()
            }],
        };
        CohereProvider::new(&config, Arc::new(MemoryStore::new())).unwrap()
    }

    #[tokio::test]
    async fn test_generate_is_unsupported_without_upstream_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = provider(&server)
            .generate(&LLMRequest {
                prompt: Some("hi".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unsupported { .. }));
        assert_eq!(err.to_string(), "cohere does not support chat completions");
    }

    #[tokio::test]
    async fn test_embed_v2() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/embed"))
            .and(header("authorization", "Bearer co-key"))
            .and(body_partial_json(json!({
                "model": "embed-english-v3.0",
                "texts": ["a", "b"],
                "embedding_types": ["float"]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "e1",
                "embeddings": {"float": [[0.1, 0.2], [0.3, 0.4]]},
                "meta": {"billed_units": {"input_tokens": 4}}
            })))
            .mount(&server)
            .await;

        let response = provider(&server)
            .create_embeddings(&EmbeddingRequest {
                input: vec!["a".into(), "b".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(response.embeddings.len(), 2);
        assert_eq!(response.embeddings[1], vec![0.3, 0.4]);
        assert_eq!(response.total_tokens, 4);
        assert_eq!(response.key_id, "c1");
    }
}
