//! Admin API: read-only introspection over configuration and the usage store.
//!
//! All endpoints require `Authorization: Bearer <server.admin_api_key>`.
//! Without an admin key configured the admin API is disabled.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use utoipa::{IntoParams, OpenApi, ToSchema};

use crate::api::auth::extract_bearer;
use crate::api::AppState;
use crate::core::config::GatewayConfig;
use crate::providers::ProviderError;
use crate::services::usage::{LATENCY_METRIC, TOKENS_METRIC};
use crate::store::{now_secs, MetricPoint, StoreError, UsageMetric};

/// Provider model listings are cached in the store for this long.
pub const MODELS_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_RANGE_SECS: i64 = 3600;

/// OpenAPI document for the client and admin endpoints.
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::api::handlers::chat_completions,
        crate::api::handlers::embeddings,
        crate::api::handlers::list_models,
        crate::api::health::health,
        get_config,
        validate_config,
        query_metrics,
        get_stats,
        get_clients,
        list_providers,
        list_provider_models,
        get_key_usage,
    ),
    components(
        schemas(
            crate::api::models::ChatCompletionRequest,
            crate::api::models::ChatCompletionResponse,
            crate::api::models::Message,
            crate::api::models::MessageContent,
            crate::api::models::ContentPart,
            crate::api::models::Choice,
            crate::api::models::ResponseMessage,
            crate::api::models::Usage,
            crate::api::models::StreamChunk,
            crate::api::models::StreamChoice,
            crate::api::models::Delta,
            crate::api::models::EmbeddingsRequest,
            crate::api::models::EmbeddingInput,
            crate::api::models::EmbeddingsResponse,
            crate::api::models::EmbeddingData,
            crate::api::models::EmbeddingUsage,
            crate::api::models::ModelList,
            crate::api::models::ModelInfo,
            crate::api::models::HealthResponse,
            crate::api::models::ApiErrorResponse,
            crate::api::models::ApiErrorDetail,
            ValidateResponse,
            MetricPointResponse,
            GroupStats,
            StatsResponse,
            ClientStats,
            ClientsResponse,
            ProviderSummary,
            ProviderListResponse,
            ProviderModelsResponse,
            KeyUsageResponse,
        )
    ),
    tags(
        (name = "completions", description = "OpenAI-compatible chat completions"),
        (name = "embeddings", description = "OpenAI-compatible embeddings"),
        (name = "models", description = "Model listing"),
        (name = "health", description = "Liveness"),
        (name = "admin", description = "Configuration and usage introspection")
    ),
    info(
        title = "LLM Gateway API",
        version = "1.0.0",
        description = "OpenAI-compatible gateway endpoints and the read-only admin API."
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::Http::new(
                        utoipa::openapi::security::HttpAuthScheme::Bearer,
                    ),
                ),
            );
        }
    }
}

/// Admin API error types
#[derive(Debug)]
pub enum AdminError {
    Unauthorized,
    Disabled,
    NotFound(String),
    BadRequest(String),
    Store(StoreError),
    Provider(ProviderError),
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AdminError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            AdminError::Disabled => (
                StatusCode::FORBIDDEN,
                "Admin API is disabled: server.admin_api_key is not set".to_string(),
            ),
            AdminError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AdminError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AdminError::Store(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            AdminError::Provider(e) => (StatusCode::BAD_GATEWAY, e.to_string()),
        };

        let body = serde_json::json!({
            "error": {
                "message": message,
                "code": status.as_u16()
            }
        });

        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for AdminError {
    fn from(e: StoreError) -> Self {
        AdminError::Store(e)
    }
}

/// Verify admin authentication
pub fn verify_admin_auth(headers: &HeaderMap, admin_key: Option<&str>) -> Result<(), AdminError> {
    let admin_key = admin_key.filter(|k| !k.is_empty()).ok_or(AdminError::Disabled)?;
    match extract_bearer(headers) {
        Some(provided) if provided == admin_key => Ok(()),
        _ => Err(AdminError::Unauthorized),
    }
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), AdminError> {
    verify_admin_auth(headers, state.config.server.admin_api_key.as_deref())
}

// ============================================================================
// Query and response types
// ============================================================================

#[derive(Debug, Deserialize, IntoParams)]
pub struct TimeRange {
    /// Unix seconds, default `end - 3600`
    pub start: Option<i64>,
    /// Unix seconds, default now
    pub end: Option<i64>,
}

impl TimeRange {
    fn bounds(&self) -> Result<(i64, i64), AdminError> {
        let end = self.end.unwrap_or_else(now_secs);
        let start = self.start.unwrap_or(end - DEFAULT_RANGE_SECS);
        if start > end {
            return Err(AdminError::BadRequest("start must not be after end".into()));
        }
        Ok((start, end))
    }
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct MetricsQuery {
    pub name: String,
    pub start: Option<i64>,
    pub end: Option<i64>,
    /// Comma-separated `key:value` tag filters, all of which must match
    pub tag: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct StatsQuery {
    /// `client_key`, `provider` or `key`
    pub group_by: String,
    pub start: Option<i64>,
    pub end: Option<i64>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct UsageQuery {
    /// Window in seconds for the windowed sums
    pub window: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ValidateResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MetricPointResponse {
    pub name: String,
    pub tags: HashMap<String, String>,
    pub value: f64,
    pub timestamp: i64,
}

impl From<MetricPoint> for MetricPointResponse {
    fn from(p: MetricPoint) -> Self {
        Self {
            name: p.name,
            tags: p.tags,
            value: p.value,
            timestamp: p.timestamp,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct GroupStats {
    pub requests: u64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: f64,
    pub total_tokens: f64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StatsResponse {
    pub group_by: String,
    pub start: i64,
    pub end: i64,
    pub groups: BTreeMap<String, GroupStats>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ClientStats {
    pub requests: u64,
    pub avg_latency_ms: f64,
    pub total_tokens: f64,
    /// Share of requests answered with a status below 400
    pub success_rate: f64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ClientsResponse {
    pub start: i64,
    pub end: i64,
    pub clients: BTreeMap<String, ClientStats>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ProviderSummary {
    pub id: String,
    #[serde(rename = "type")]
    pub provider_type: String,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
    pub keys: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ProviderListResponse {
    pub strategy: String,
    pub providers: Vec<ProviderSummary>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ProviderModelsResponse {
    pub provider: String,
    pub models: Vec<String>,
    pub cached: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct KeyUsageResponse {
    pub provider: String,
    pub key: String,
    pub usage: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<BTreeMap<String, f64>>,
}

/// Parse `k1:v1,k2:v2` into a tag filter.
fn parse_tag_filter(raw: Option<&str>) -> Result<HashMap<String, String>, AdminError> {
    let mut filter = HashMap::new();
    for pair in raw.unwrap_or("").split(',').filter(|p| !p.trim().is_empty()) {
        let (k, v) = pair
            .split_once(':')
            .ok_or_else(|| AdminError::BadRequest(format!("tag '{}' must be key:value", pair)))?;
        filter.insert(k.trim().to_string(), v.trim().to_string());
    }
    Ok(filter)
}

// ============================================================================
// Aggregation
// ============================================================================

#[derive(Default)]
struct Accumulator {
    requests: u64,
    successes: u64,
    latency_sum: f64,
    latency_max: f64,
    tokens: f64,
}

impl Accumulator {
    fn avg_latency(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.latency_sum / self.requests as f64
        }
    }
}

/// Group label of a point. Key ids are only unique within a provider, so
/// `key` groups are `provider/key`.
fn group_of(point: &MetricPoint, tag: &str) -> Option<String> {
    let value = point.tags.get(tag)?;
    if tag == "key" {
        let provider = point.tags.get("provider")?;
        return Some(format!("{}/{}", provider, value));
    }
    Some(value.clone())
}

/// Group latency and token points by the value of `tag`; points without the
/// tag are ignored.
fn aggregate(latency: &[MetricPoint], tokens: &[MetricPoint], tag: &str) -> BTreeMap<String, Accumulator> {
    let mut groups: BTreeMap<String, Accumulator> = BTreeMap::new();
    for point in latency {
        let Some(group) = group_of(point, tag) else { continue };
        let acc = groups.entry(group).or_default();
        acc.requests += 1;
        acc.latency_sum += point.value;
        acc.latency_max = acc.latency_max.max(point.value);
        let ok = point
            .tags
            .get("status")
            .and_then(|s| s.parse::<u16>().ok())
            .is_some_and(|s| s < 400);
        if ok {
            acc.successes += 1;
        }
    }
    for point in tokens {
        let Some(group) = group_of(point, tag) else { continue };
        groups.entry(group).or_default().tokens += point.value;
    }
    groups
}

async fn load_points(
    state: &AppState,
    start: i64,
    end: i64,
) -> Result<(Vec<MetricPoint>, Vec<MetricPoint>), AdminError> {
    let store = state.recorder.store();
    let no_filter = HashMap::new();
    let latency = store.get_metrics(LATENCY_METRIC, &no_filter, start, end).await?;
    let tokens = store.get_metrics(TOKENS_METRIC, &no_filter, start, end).await?;
    Ok((latency, tokens))
}

// ============================================================================
// Handlers
// ============================================================================

/// Current configuration with secrets redacted
#[utoipa::path(
    get,
    path = "/admin/v1/config",
    tag = "admin",
    responses((status = 200, description = "Redacted configuration"), (status = 401, description = "Unauthorized")),
    security(("bearer_auth" = []))
)]
pub async fn get_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<GatewayConfig>, AdminError> {
    authorize(&state, &headers)?;
    Ok(Json(state.config.redacted()))
}

/// Validate a candidate configuration (YAML or JSON body)
#[utoipa::path(
    post,
    path = "/admin/v1/config/validate",
    tag = "admin",
    request_body(content = String, description = "Configuration as YAML or JSON"),
    responses(
        (status = 200, description = "Configuration is valid", body = ValidateResponse),
        (status = 400, description = "Configuration is invalid", body = ValidateResponse),
        (status = 401, description = "Unauthorized")
    ),
    security(("bearer_auth" = []))
)]
pub async fn validate_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, AdminError> {
    authorize(&state, &headers)?;

    // JSON is a subset of YAML, so one parser covers both.
    let result = GatewayConfig::from_yaml(&body).and_then(|config| config.validate());
    let response = match result {
        Ok(()) => (
            StatusCode::OK,
            Json(ValidateResponse {
                valid: true,
                error: None,
            }),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(ValidateResponse {
                valid: false,
                error: Some(format!("{:#}", e)),
            }),
        ),
    };
    Ok(response.into_response())
}

/// Raw metric points
#[utoipa::path(
    get,
    path = "/admin/v1/metrics",
    tag = "admin",
    params(MetricsQuery),
    responses((status = 200, description = "Matching metric points", body = [MetricPointResponse]), (status = 401, description = "Unauthorized")),
    security(("bearer_auth" = []))
)]
pub async fn query_metrics(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<MetricsQuery>,
) -> Result<Json<Vec<MetricPointResponse>>, AdminError> {
    authorize(&state, &headers)?;
    let (start, end) = TimeRange {
        start: query.start,
        end: query.end,
    }
    .bounds()?;
    let filter = parse_tag_filter(query.tag.as_deref())?;

    let points = state
        .recorder
        .store()
        .get_metrics(&query.name, &filter, start, end)
        .await?;
    Ok(Json(points.into_iter().map(Into::into).collect()))
}

/// Request latency and tokens grouped by client key, provider or key
#[utoipa::path(
    get,
    path = "/admin/v1/stats",
    tag = "admin",
    params(StatsQuery),
    responses((status = 200, description = "Grouped statistics", body = StatsResponse), (status = 400, description = "Unknown group_by"), (status = 401, description = "Unauthorized")),
    security(("bearer_auth" = []))
)]
pub async fn get_stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<StatsQuery>,
) -> Result<Json<StatsResponse>, AdminError> {
    authorize(&state, &headers)?;
    if !matches!(query.group_by.as_str(), "client_key" | "provider" | "key") {
        return Err(AdminError::BadRequest(format!(
            "group_by must be one of client_key, provider, key; got '{}'",
            query.group_by
        )));
    }
    let (start, end) = TimeRange {
        start: query.start,
        end: query.end,
    }
    .bounds()?;

    let (latency, tokens) = load_points(&state, start, end).await?;
    let groups = aggregate(&latency, &tokens, &query.group_by)
        .into_iter()
        .map(|(name, acc)| {
            (
                name,
                GroupStats {
                    requests: acc.requests,
                    avg_latency_ms: acc.avg_latency(),
                    max_latency_ms: acc.latency_max,
                    total_tokens: acc.tokens,
                },
            )
        })
        .collect();

    Ok(Json(StatsResponse {
        group_by: query.group_by,
        start,
        end,
        groups,
    }))
}

/// Per-client-key request count, latency, tokens and success rate
#[utoipa::path(
    get,
    path = "/admin/v1/clients",
    tag = "admin",
    params(TimeRange),
    responses((status = 200, description = "Per-client statistics", body = ClientsResponse), (status = 401, description = "Unauthorized")),
    security(("bearer_auth" = []))
)]
pub async fn get_clients(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(range): Query<TimeRange>,
) -> Result<Json<ClientsResponse>, AdminError> {
    authorize(&state, &headers)?;
    let (start, end) = range.bounds()?;

    let (latency, tokens) = load_points(&state, start, end).await?;
    let clients = aggregate(&latency, &tokens, "client_key")
        .into_iter()
        .map(|(name, acc)| {
            let success_rate = if acc.requests == 0 {
                0.0
            } else {
                acc.successes as f64 / acc.requests as f64
            };
            (
                name,
                ClientStats {
                    requests: acc.requests,
                    avg_latency_ms: acc.avg_latency(),
                    total_tokens: acc.tokens,
                    success_rate,
                },
            )
        })
        .collect();

    Ok(Json(ClientsResponse { start, end, clients }))
}

/// Configured providers and their key ids
#[utoipa::path(
    get,
    path = "/admin/v1/providers",
    tag = "admin",
    responses((status = 200, description = "Providers", body = ProviderListResponse), (status = 401, description = "Unauthorized")),
    security(("bearer_auth" = []))
)]
pub async fn list_providers(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ProviderListResponse>, AdminError> {
    authorize(&state, &headers)?;
    let providers = state
        .config
        .providers
        .iter()
        .map(|p| ProviderSummary {
            id: p.id.clone(),
            provider_type: p.provider_type.as_str().to_string(),
            base_url: p.base_url(),
            default_model: p.model.clone(),
            keys: p.keys.iter().map(|k| k.id.clone()).collect(),
        })
        .collect();

    Ok(Json(ProviderListResponse {
        strategy: state.config.policy.strategy.as_str().to_string(),
        providers,
    }))
}

/// Upstream model list for one provider, cached for five minutes
#[utoipa::path(
    get,
    path = "/admin/v1/providers/{id}/models",
    tag = "admin",
    params(("id" = String, Path, description = "Provider id")),
    responses(
        (status = 200, description = "Models", body = ProviderModelsResponse),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Unknown provider"),
        (status = 502, description = "Upstream listing failed")
    ),
    security(("bearer_auth" = []))
)]
pub async fn list_provider_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ProviderModelsResponse>, AdminError> {
    authorize(&state, &headers)?;
    let adapter = state
        .registry
        .get(&id)
        .ok_or_else(|| AdminError::NotFound(format!("provider '{}' not found", id)))?;

    let store = state.recorder.store();
    let cache_key = format!("models:{}", id);
    match store.get_cache(&cache_key).await {
        Ok(cached) if !cached.is_empty() => match serde_json::from_str::<Vec<String>>(&cached) {
            Ok(models) => {
                return Ok(Json(ProviderModelsResponse {
                    provider: id,
                    models,
                    cached: true,
                }))
            }
            Err(e) => tracing::warn!(provider = %id, error = %e, "Ignoring corrupt model cache entry"),
        },
        Ok(_) => {}
        Err(e) => tracing::warn!(provider = %id, error = %e, "Model cache read failed"),
    }

    let models = adapter.list_models().await.map_err(AdminError::Provider)?;
    match serde_json::to_string(&models) {
        Ok(encoded) => {
            if let Err(e) = store.set_cache(&cache_key, &encoded, MODELS_CACHE_TTL_SECS).await {
                tracing::warn!(provider = %id, error = %e, "Model cache write failed");
            }
        }
        Err(e) => tracing::warn!(provider = %id, error = %e, "Failed to encode model list"),
    }

    Ok(Json(ProviderModelsResponse {
        provider: id,
        models,
        cached: false,
    }))
}

/// All usage counters of one key, with optional windowed sums
#[utoipa::path(
    get,
    path = "/admin/v1/usage/{provider}/{key}",
    tag = "admin",
    params(
        ("provider" = String, Path, description = "Provider id"),
        ("key" = String, Path, description = "Key id"),
        UsageQuery
    ),
    responses(
        (status = 200, description = "Usage counters", body = KeyUsageResponse),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Unknown provider or key")
    ),
    security(("bearer_auth" = []))
)]
pub async fn get_key_usage(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((provider, key)): Path<(String, String)>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<KeyUsageResponse>, AdminError> {
    authorize(&state, &headers)?;
    let known = state
        .config
        .provider(&provider)
        .is_some_and(|p| p.key(&key).is_some());
    if !known {
        return Err(AdminError::NotFound(format!(
            "key '{}' of provider '{}' not found",
            key, provider
        )));
    }

    let store = state.recorder.store();
    let mut usage = BTreeMap::new();
    let mut window = query.window.map(|_| BTreeMap::new());
    for metric in UsageMetric::ALL {
        usage.insert(
            metric.as_str().to_string(),
            store.get_usage(&provider, &key, metric).await?,
        );
        if let (Some(secs), Some(sums)) = (query.window, window.as_mut()) {
            sums.insert(
                metric.as_str().to_string(),
                store.get_usage_in_window(&provider, &key, metric, secs).await?,
            );
        }
    }

    Ok(Json(KeyUsageResponse {
        provider,
        key,
        usage,
        window_secs: query.window,
        window,
    }))
}

// ============================================================================
// Router
// ============================================================================

/// Create Admin API router, nested under `/admin/v1`
pub fn admin_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/config", get(get_config))
        .route("/config/validate", post(validate_config))
        .route("/metrics", get(query_metrics))
        .route("/stats", get(get_stats))
        .route("/clients", get(get_clients))
        .route("/providers", get(list_providers))
        .route("/providers/:id/models", get(list_provider_models))
        .route("/usage/:provider/:key", get(get_key_usage))
}
