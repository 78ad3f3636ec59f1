//! Shared helpers for the integration tests.

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{header, Request, Response},
    Router,
};
use llm_gateway::{
    build_router, store::MemoryStore, AppState, GatewayConfig, ProviderRegistry,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

pub const ADMIN_KEY: &str = "admin-secret";

/// Router plus the memory store behind it, so tests can seed and inspect counters.
pub struct TestGateway {
    pub app: Router,
    pub store: Arc<MemoryStore>,
    pub state: Arc<AppState>,
}

impl TestGateway {
    pub fn from_yaml(yaml: &str) -> Self {
        let config = GatewayConfig::from_yaml(yaml).expect("test config parses");
        Self::from_config(config)
    }

    pub fn from_config(config: GatewayConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let registry =
            ProviderRegistry::from_config(&config, store.clone()).expect("providers register");
        let state = Arc::new(AppState::new(config, registry, store.clone()));
        Self {
            app: build_router(state.clone()),
            store,
            state,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.expect("router is infallible")
    }

    pub async fn post_json(&self, uri: &str, body: Value) -> Response<Body> {
        self.send(post(uri, body)).await
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    pub async fn admin_get(&self, uri: &str) -> Response<Body> {
        self.send(
            Request::get(uri)
                .header(header::AUTHORIZATION, format!("Bearer {}", ADMIN_KEY))
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }
}

pub fn post(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    String::from_utf8(body_bytes(response).await).unwrap()
}

/// Config with one provider of `provider_type` pointed at `base_url`.
pub fn single_provider_yaml(provider_type: &str, base_url: &str, keys: &[&str]) -> String {
    let keys: String = keys
        .iter()
        .map(|id| format!("      - id: {id}\n        secret: sk-{id}\n"))
        .collect();
    format!(
        r#"
version: "1"
server:
  admin_api_key: {ADMIN_KEY}
providers:
  - id: {provider_type}
    name: {provider_type}
    base_url: {base_url}
    keys:
{keys}
"#
    )
}

pub fn chat_completion(content: &str) -> Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "created": 1700000000,
        "model": "gpt-4o",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8}
    })
}

pub fn hello(model: &str) -> Value {
    json!({"model": model, "messages": [{"role": "user", "content": "Hello"}]})
}
