//! Voyage AI embeddings adapter.

use super::openai::parse_embeddings;
use super::{
    build_http_client, check_status, EmbeddingRequest, EmbeddingResponse, KeyPool, LLMRequest,
    LLMResponse, Provider, ProviderError, ProviderResult,
};
use crate::core::config::{ProviderConfig, ProviderType};
use crate::store::SharedStore;
use async_trait::async_trait;
use serde_json::{json, Value};

/// Voyage has no listing endpoint; this is what the public API serves.
const KNOWN_MODELS: &[&str] = &[
    "voyage-3-large",
    "voyage-3.5",
    "voyage-3.5-lite",
    "voyage-code-3",
    "voyage-finance-2",
    "voyage-law-2",
];

pub struct VoyageProvider {
    id: String,
    base_url: String,
    default_model: Option<String>,
    static_models: Vec<String>,
    client: reqwest::Client,
    pool: KeyPool,
}

impl VoyageProvider {
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
impl Provider for VoyageProvider {
    fn name(&self) -> &str {
        &self.id
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Voyage
    }

    async fn generate(&self, _request: &LLMRequest) -> ProviderResult<LLMResponse> {
        Err(ProviderError::unsupported(&self.id, "chat completions"))
    }

    async fn list_models(&self) -> ProviderResult<Vec<String>> {
        if !self.static_models.is_empty() {
            return Ok(self.static_models.clone());
        }
        Ok(KNOWN_MODELS.iter().map(|m| m.to_string()).collect())
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

        let mut body = json!({"model": model, "input": request.input});
        if let Some(dimensions) = request.dimensions {
            body["output_dimension"] = json!(dimensions);
        }

        self.pool
            .execute(request.preferred_key.as_deref(), |key| {
                let body = &body;
                async move {
                    let response = self
                        .client
                        .post(format!("{}/embeddings", self.base_url))
                        .bearer_auth(&key.secret)
                        .json(body)
                        .send()
                        .await?;
                    let raw: Value = check_status(response).await?.json().await?;
                    parse_embeddings(&raw, &key.id)
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
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer, keys: &[&str]) -> VoyageProvider {
        let config = ProviderConfig {
            id: "voyage".into(),
            provider_type: ProviderType::Voyage,
            base_url: Some(server.uri()),
            model: Some("voyage-3.5".into()),
            timeout_secs: Some(5),
            models: vec![],
            keys: keys
                .iter()
                .map(|id| KeyConfig {
                    id: id.to_string(),
                    secret: format!("pa-{}", id),
                    ..Default::default()
                })
                .collect(),
        };
        VoyageProvider::new(&config, Arc::new(MemoryStore::new())).unwrap()
    }

    #[tokio::test]
    async fn test_embeddings_with_dimension() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(body_partial_json(json!({"model": "voyage-3.5", "output_dimension": 256})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": "list",
                "data": [{"object": "embedding", "embedding": [0.1, 0.9], "index": 0}],
                "model": "voyage-3.5",
                "usage": {"total_tokens": 3}
            })))
            .mount(&server)
            .await;

        let response = provider(&server, &["v1"])
            .create_embeddings(&EmbeddingRequest {
                input: vec!["doc".into()],
                dimensions: Some(256),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(response.embeddings, vec![vec![0.1, 0.9]]);
        assert_eq!(response.prompt_tokens, 3);
        assert_eq!(response.total_tokens, 3);
    }

    #[tokio::test]
    async fn test_retries_on_server_error_then_gives_up() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .expect(3)
            .mount(&server)
            .await;

        let err = provider(&server, &["v1", "v2"])
            .create_embeddings(&EmbeddingRequest {
                input: vec!["doc".into()],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Exhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_chat_unsupported_and_static_models() {
        let server = MockServer::start().await;
        let provider = provider(&server, &["v1"]);
        assert!(matches!(
            provider.generate(&LLMRequest::default()).await,
            Err(ProviderError::Unsupported { .. })
        ));
        assert!(provider
            .list_models()
            .await
            .unwrap()
            .contains(&"voyage-3.5".to_string()));
    }
}
