//! HTTP request handlers for the OpenAI-compatible API.
//!
//! Every generation or embedding request runs the same pipeline:
//! authenticate, resolve and select a key, invoke the adapter, record usage,
//! translate the response.

use crate::api::auth::{check_model_permission, client_name, verify_auth};
use crate::api::models::*;
use crate::api::streaming::{create_sse_response, StreamContext};
use crate::api::AppState;
use crate::core::logging::{generate_request_id, get_request_id, PROVIDER_CONTEXT};
use crate::core::middleware::{ClientKeyName, ModelName, ProviderName};
use crate::core::{AppError, CancelGuard, Result};
use crate::providers::{estimate_tokens, Provider, ProviderError};
use crate::services::{RequestOutcome, Selection, UsageRecorder};
use crate::with_request_context;
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use prometheus::{Encoder, TextEncoder};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

/// Status recorded in metric points when the client goes away mid-request.
const CLIENT_CLOSED_STATUS: u16 = 408;

/// Decode a JSON object body that must carry a non-empty `model` string.
fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| AppError::BadRequest(format!("invalid JSON body: {}", e)))?;
    if !value.is_object() {
        return Err(AppError::BadRequest("request body must be a JSON object".into()));
    }
    match value.get("model") {
        Some(Value::String(model)) if !model.is_empty() => {}
        _ => return Err(AppError::BadRequest("'model' must be a non-empty string".into())),
    }
    serde_json::from_value(value).map_err(|e| AppError::BadRequest(e.to_string()))
}

fn current_request_id() -> String {
    Some(get_request_id())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(generate_request_id)
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

/// Provider, key and adapter chosen for one request.
struct Route {
    selection: Selection,
    adapter: Arc<dyn Provider>,
    client_key: String,
    model: String,
    started: Instant,
}

impl Route {
    async fn select(state: &AppState, model: &str, client_key: String) -> Result<Self> {
        let started = Instant::now();
        let selection = state.selector.select_best(model).await?;
        let adapter = state
            .registry
            .get(&selection.provider.id)
            .ok_or_else(|| AppError::ProviderUnavailable(selection.provider.id.clone()))?;
        Ok(Self {
            selection,
            adapter,
            client_key,
            model: model.to_string(),
            started,
        })
    }

    fn provider_id(&self) -> &str {
        &self.selection.provider.id
    }

    fn selected_key(&self) -> &str {
        &self.selection.key().id
    }

    /// Outcome charged to `key_id`, falling back to the selected key.
    fn outcome(&self, key_id: &str, status: u16, input_tokens: u64, output_tokens: u64) -> RequestOutcome {
        let key = self
            .selection
            .provider
            .key(key_id)
            .unwrap_or_else(|| self.selection.key())
            .clone();
        RequestOutcome {
            client_key: self.client_key.clone(),
            provider: self.provider_id().to_string(),
            key,
            model: self.model.clone(),
            status,
            latency_ms: elapsed_ms(self.started),
            input_tokens,
            output_tokens,
        }
    }

    /// Records a failure on `key_id` if dropped while still armed.
    fn cancel_guard(&self, recorder: &UsageRecorder, key_id: &str) -> CancelGuard {
        let recorder = recorder.clone();
        let mut outcome = self.outcome(key_id, CLIENT_CLOSED_STATUS, 0, 0);
        let started = self.started;
        CancelGuard::new(move || {
            outcome.latency_ms = elapsed_ms(started);
            tracing::info!(
                provider = %outcome.provider,
                key = %outcome.key.id,
                "Client disconnected, recording failure"
            );
            recorder.spawn_failure(outcome);
        })
    }

    /// Attach the labels the metrics middleware reads.
    fn label(&self, mut response: Response) -> Response {
        let extensions = response.extensions_mut();
        extensions.insert(ModelName(self.model.clone()));
        extensions.insert(ProviderName(self.provider_id().to_string()));
        extensions.insert(ClientKeyName(self.client_key.clone()));
        response
    }

    /// Map an adapter error to the HTTP response, counting it against the
    /// selected key when the upstream was at fault.
    async fn fail(&self, recorder: &UsageRecorder, err: ProviderError) -> Response {
        let err = AppError::from(err);
        if err.counts_as_upstream_error() {
            let outcome = self.outcome(self.selected_key(), err.status_code().as_u16(), 0, 0);
            recorder.record_failure(&outcome).await;
        }
        self.label(err.into_response())
    }
}

/// Handle chat completion requests.
///
/// Supports both streaming and non-streaming responses.
#[utoipa::path(
    post,
    path = "/v1/chat/completions",
    tag = "completions",
    request_body = ChatCompletionRequest,
    responses(
        (status = 200, description = "Chat completion (or SSE stream when `stream` is true)", body = ChatCompletionResponse),
        (status = 400, description = "Invalid request or unsupported capability", body = ApiErrorResponse),
        (status = 401, description = "Unauthorized", body = ApiErrorResponse),
        (status = 403, description = "Model not allowed for this key", body = ApiErrorResponse),
        (status = 404, description = "Unknown model", body = ApiErrorResponse),
        (status = 500, description = "Upstream error", body = ApiErrorResponse),
        (status = 503, description = "No key available", body = ApiErrorResponse)
    ),
    security(("bearer_auth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let client = verify_auth(&headers, &state.config.client_keys)?;
    let request: ChatCompletionRequest = parse_body(&body)?;
    check_model_permission(client, &request.model)?;
    let client_key = client_name(client);

    with_request_context!(current_request_id(), client_key.clone(), async move {
        let route = Route::select(&state, &request.model, client_key).await?;
        let llm_request =
            request.to_llm_request(&route.selection.upstream_model, route.selected_key());

        tracing::debug!(
            model = %request.model,
            provider = %route.provider_id(),
            key = %route.selected_key(),
            upstream_model = %route.selection.upstream_model,
            stream = request.is_stream(),
            "Processing chat completion request"
        );

        let mut guard = route.cancel_guard(&state.recorder, route.selected_key());

        if request.is_stream() {
            let opened = PROVIDER_CONTEXT
                .scope(
                    route.provider_id().to_string(),
                    route.adapter.generate_stream(&llm_request),
                )
                .await;
            guard.disarm();
            let stream = match opened {
                Ok(stream) => stream,
                Err(e) => return Ok(route.fail(&state.recorder, e).await),
            };

            let input_len: usize = llm_request.conversation().iter().map(|m| m.content.len()).sum();
            let ctx = StreamContext {
                model: request.model.clone(),
                recorder: state.recorder.clone(),
                outcome: route.outcome(&stream.key_id, 200, 0, 0),
                started: route.started,
                input_estimate: estimate_tokens(input_len),
                guard: route.cancel_guard(&state.recorder, &stream.key_id),
            };
            return Ok(route.label(create_sse_response(stream, ctx)?));
        }

        let result = PROVIDER_CONTEXT
            .scope(route.provider_id().to_string(), route.adapter.generate(&llm_request))
            .await;
        guard.disarm();

        match result {
            Ok(response) => {
                let outcome = route.outcome(
                    &response.key_id,
                    response.status,
                    response.input_tokens,
                    response.output_tokens,
                );
                state.recorder.record_success(&outcome).await;

                let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK);
                let body = response.to_openai_body(&request.model);
                Ok(route.label((status, Json(body)).into_response()))
            }
            Err(e) => Ok(route.fail(&state.recorder, e).await),
        }
    })
}

/// Handle embedding requests.
#[utoipa::path(
    post,
    path = "/v1/embeddings",
    tag = "embeddings",
    request_body = EmbeddingsRequest,
    responses(
        (status = 200, description = "Embeddings", body = EmbeddingsResponse),
        (status = 400, description = "Empty input or provider without embeddings", body = ApiErrorResponse),
        (status = 401, description = "Unauthorized", body = ApiErrorResponse),
        (status = 404, description = "Unknown model", body = ApiErrorResponse),
        (status = 503, description = "No key available", body = ApiErrorResponse)
    ),
    security(("bearer_auth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn embeddings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let client = verify_auth(&headers, &state.config.client_keys)?;
    let request: EmbeddingsRequest = parse_body(&body)?;
    if !request.has_input() {
        return Err(AppError::BadRequest("'input' must not be empty".into()));
    }
    check_model_permission(client, &request.model)?;
    let client_key = client_name(client);

    with_request_context!(current_request_id(), client_key.clone(), async move {
        let route = Route::select(&state, &request.model, client_key).await?;
        let embedding_request =
            request.to_embedding_request(&route.selection.upstream_model, route.selected_key());

        let mut guard = route.cancel_guard(&state.recorder, route.selected_key());
        let result = PROVIDER_CONTEXT
            .scope(
                route.provider_id().to_string(),
                route.adapter.create_embeddings(&embedding_request),
            )
            .await;
        guard.disarm();

        match result {
            Ok(response) => {
                let outcome = route.outcome(&response.key_id, 200, response.prompt_tokens, 0);
                state.recorder.record_success(&outcome).await;
                Ok(route.label(Json(response.to_openai_body(&request.model)).into_response()))
            }
            Err(e) => Ok(route.fail(&state.recorder, e).await),
        }
    })
}

/// List client-facing model aliases.
#[utoipa::path(
    get,
    path = "/v1/models",
    tag = "models",
    responses(
        (status = 200, description = "Model aliases", body = ModelList),
        (status = 401, description = "Unauthorized", body = ApiErrorResponse)
    ),
    security(("bearer_auth" = []))
)]
pub async fn list_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ModelList>> {
    let client = verify_auth(&headers, &state.config.client_keys)?;
    let allowed = client.map(|c| c.allowed_models.as_slice()).unwrap_or(&[]);

    let data = state
        .selector
        .resolver()
        .alias_names()
        .filter(|name| crate::api::auth::is_model_allowed(allowed, name))
        .map(|name| ModelInfo {
            id: name.to_string(),
            object: "model".to_string(),
            created: state.started_at,
            owned_by: state.config.server.name.clone(),
        })
        .collect();

    Ok(Json(ModelList {
        object: "list".to_string(),
        data,
    }))
}

/// Prometheus exposition of the default registry.
pub async fn metrics_handler() -> Result<Response> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok(([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_body_requires_model() {
        let parsed: Result<ChatCompletionRequest> = parse_body(br#"{"messages": []}"#);
        assert_matches!(parsed, Err(AppError::BadRequest(_)));

        let parsed: Result<ChatCompletionRequest> = parse_body(br#"{"model": 3}"#);
        assert_matches!(parsed, Err(AppError::BadRequest(_)));

        let parsed: Result<ChatCompletionRequest> = parse_body(b"[1, 2]");
        assert_matches!(parsed, Err(AppError::BadRequest(_)));

        let parsed: Result<ChatCompletionRequest> = parse_body(b"not json");
        assert_matches!(parsed, Err(AppError::BadRequest(_)));

        let parsed: ChatCompletionRequest =
            parse_body(br#"{"model": "gpt-4o", "prompt": "hi"}"#).unwrap();
        assert_eq!(parsed.prompt.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn test_metrics_handler_exposes_text_format() {
        crate::core::init_metrics();
        let response = metrics_handler().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
        assert!(content_type.starts_with("text/plain"));
    }
}
