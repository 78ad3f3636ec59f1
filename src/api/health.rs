//! Liveness endpoint.

use axum::{extract::State, Json};
use std::sync::Arc;

use crate::api::models::HealthResponse;
use crate::api::AppState;

/// Liveness probe; does not touch upstreams or the store.
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses((status = 200, description = "Gateway is up", body = HealthResponse))
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        providers: state.registry.len(),
        store: state.recorder.store().backend().to_string(),
    })
}
