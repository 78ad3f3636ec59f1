//! Replicate predictions adapter.
//!
//! A prediction is created with `Prefer: wait`; when the upstream answers
//! before the model finished, the prediction is polled until it settles or the
//! provider timeout elapses.

use super::{
    build_http_client, check_status, normalize_role, KeyPool, LLMRequest, LLMResponse, Provider,
    ProviderError, ProviderResult,
};
use crate::core::config::{KeyConfig, ProviderConfig, ProviderType};
use crate::store::SharedStore;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::time::Instant;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Deserialize)]
struct Prediction {
    id: String,
    status: String,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    metrics: Option<PredictionMetrics>,
}

#[derive(Debug, Default, Deserialize)]
struct PredictionMetrics {
    #[serde(default)]
    input_token_count: Option<u64>,
    #[serde(default)]
    output_token_count: Option<u64>,
}

impl Prediction {
    fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "succeeded" | "failed" | "canceled")
    }

    /// Language models stream tokens into an array of strings.
    fn output_text(&self) -> String {
        match &self.output {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
            _ => String::new(),
        }
    }
}

pub struct ReplicateProvider {
    id: String,
    base_url: String,
    default_model: Option<String>,
    static_models: Vec<String>,
    timeout: Duration,
    poll_interval: Duration,
    client: reqwest::Client,
    pool: KeyPool,
}

/// Flatten a conversation into Replicate's `prompt` / `system_prompt` inputs.
fn prompt_inputs(request: &LLMRequest) -> ProviderResult<(String, Option<String>)> {
    let conversation = request.conversation();
    let mut system = Vec::new();
    let mut turns = Vec::new();
    for message in &conversation {
        match normalize_role(&message.role) {
            "system" => system.push(message.content.as_str()),
            role => turns.push((role, message.content.as_str())),
        }
    }

    let prompt = match turns.as_slice() {
        [] => {
            return Err(ProviderError::InvalidRequest(
                "at least one user or assistant message is required".into(),
            ))
        }
        [("user", content)] => content.to_string(),
        _ => {
            let mut transcript: String = turns
                .iter()
                .map(|(role, content)| format!("{}: {}\n", role, content))
                .collect();
            transcript.push_str("assistant:");
            transcript
        }
    };
    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    Ok((prompt, system))
}

impl ReplicateProvider {
    pub fn new(config: &ProviderConfig, store: SharedStore) -> ProviderResult<Self> {
        let base_url = config.base_url().ok_or_else(|| {
            ProviderError::InvalidRequest(format!("provider '{}' requires base_url", config.id))
        })?;
        Ok(Self {
            id: config.id.clone(),
            base_url,
            default_model: config.model.clone(),
            static_models: config.models.clone(),
            timeout: Duration::from_secs(config.timeout_secs()),
            poll_interval: DEFAULT_POLL_INTERVAL,
            client: build_http_client(config.timeout_secs())?,
            pool: KeyPool::new(&config.id, &config.keys, store),
        })
    }

    #[cfg(test)]
    fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn input_for(&self, request: &LLMRequest) -> ProviderResult<Value> {
        let (prompt, system) = prompt_inputs(request)?;
        let mut input = Map::new();
        input.insert("prompt".into(), json!(prompt));
        if let Some(system) = system {
            input.insert("system_prompt".into(), json!(system));
        }
        if let Some(max_tokens) = request.max_tokens {
            input.insert("max_tokens".into(), json!(max_tokens));
        }
        for name in ["temperature", "top_p", "seed"] {
            if let Some(value) = request.params.get(name) {
                input.insert(name.into(), value.clone());
            }
        }
        Ok(json!({"input": input}))
    }

    async fn predict(&self, key: &KeyConfig, model: &str, body: &Value) -> ProviderResult<Prediction> {
        let deadline = Instant::now() + self.timeout;
        let response = self
            .client
            .post(format!("{}/v1/models/{}/predictions", self.base_url, model))
            .bearer_auth(&key.secret)
            .header("Prefer", format!("wait={}", self.timeout.as_secs().min(60)))
            .json(body)
            .send()
            .await?;
        let mut prediction: Prediction = check_status(response).await?.json().await?;

        while !prediction.is_terminal() {
            if Instant::now() + self.poll_interval > deadline {
                self.cancel(key, &prediction.id).await;
                return Err(ProviderError::Timeout(format!(
                    "prediction {} still {} after {}s",
                    prediction.id,
                    prediction.status,
                    self.timeout.as_secs()
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
            let response = self
                .client
                .get(format!("{}/v1/predictions/{}", self.base_url, prediction.id))
                .bearer_auth(&key.secret)
                .send()
                .await?;
            prediction = check_status(response).await?.json().await?;
        }
        Ok(prediction)
    }

    async fn cancel(&self, key: &KeyConfig, prediction_id: &str) {
        let result = self
            .client
            .post(format!("{}/v1/predictions/{}/cancel", self.base_url, prediction_id))
            .bearer_auth(&key.secret)
            .send()
            .await;
        if let Err(e) = result {
            tracing::debug!(provider = %self.id, prediction = %prediction_id, error = %e, "Prediction cancel failed");
        }
    }
}

#[async_trait]
impl Provider for ReplicateProvider {
    fn name(&self) -> &str {
        &self.id
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Replicate
    }

    async fn generate(&self, request: &LLMRequest) -> ProviderResult<LLMResponse> {
        let model = request
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .or_else(|| self.default_model.clone())
            .ok_or_else(|| ProviderError::InvalidRequest(format!("no model specified for provider '{}'", self.id)))?;
        let body = self.input_for(request)?;

        self.pool
            .execute(request.preferred_key.as_deref(), |key| {
                let (body, model) = (&body, &model);
                async move {
                    let prediction = self.predict(&key, model, body).await?;
                    if prediction.status != "succeeded" {
                        let reason = match &prediction.error {
                            Some(Value::String(s)) => s.clone(),
                            Some(other) => other.to_string(),
                            None => prediction.status.clone(),
                        };
                        return Err(ProviderError::Protocol(format!(
                            "prediction {} {}: {}",
                            prediction.id, prediction.status, reason
                        )));
                    }
                    let metrics = prediction.metrics.as_ref();
                    Ok(LLMResponse::from_parts(
                        request,
                        prediction.output_text(),
                        metrics.and_then(|m| m.input_token_count),
                        metrics.and_then(|m| m.output_token_count),
                        Some("stop".to_string()),
                        &key.id,
                    ))
                }
            })
            .await
    }

    async fn list_models(&self) -> ProviderResult<Vec<String>> {
        if !self.static_models.is_empty() {
            return Ok(self.static_models.clone());
        }
        Ok(self.default_model.iter().cloned().collect())
    }
}
