//! API layer for the gateway.
//!
//! This module contains the HTTP handlers, request/response models,
//! streaming support, client auth and the admin API, plus the router that
//! wires them together.

pub mod admin;
pub mod auth;
pub mod handlers;
pub mod health;
pub mod models;
pub mod streaming;

use crate::core::config::GatewayConfig;
use crate::core::middleware::{admin_logging_middleware, request_id_middleware};
use crate::core::{KeyRateLimiter, MetricsMiddleware};
use crate::services::{ProviderRegistry, Selector, UsageRecorder};
use crate::store::SharedStore;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use admin::{admin_router, ApiDoc};
pub use handlers::{chat_completions, embeddings, list_models, metrics_handler};
pub use models::{ChatCompletionRequest, ChatCompletionResponse, EmbeddingsRequest, ModelList};

/// Shared application state. Immutable after boot.
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub registry: ProviderRegistry,
    pub selector: Selector,
    pub recorder: UsageRecorder,
    /// Unix seconds, reported as `created` in model listings
    pub started_at: i64,
}

impl AppState {
    pub fn new(config: GatewayConfig, registry: ProviderRegistry, store: SharedStore) -> Self {
        let limiter = Arc::new(KeyRateLimiter::from_providers(&config.providers));
        let selector = Selector::new(&config, store.clone(), limiter.clone());
        let recorder = UsageRecorder::new(store, limiter);
        Self {
            config: Arc::new(config),
            registry,
            selector,
            recorder,
            started_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Build router with all endpoints
pub fn build_router(state: Arc<AppState>) -> Router {
    let admin_routes = admin_router().layer(middleware::from_fn(admin_logging_middleware));

    let api_routes = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/models", get(list_models))
        .layer(middleware::from_fn(MetricsMiddleware::track_metrics));

    let mut app = Router::new()
        .nest("/admin/v1", admin_routes)
        .merge(api_routes)
        .route("/health", get(health::health));

    let prometheus = &state.config.logging.prometheus;
    if prometheus.enabled {
        app = app.route(&prometheus.endpoint, get(metrics_handler));
    }

    app.with_state(state)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
