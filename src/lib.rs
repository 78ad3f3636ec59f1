//! LLM Gateway - an OpenAI-compatible gateway in front of many LLM providers.
//!
//! Clients call one uniform API for chat completions, embeddings and model
//! listing. Per request the gateway resolves the client model, picks one
//! provider key under a scoring policy fed by a pluggable usage store,
//! translates the call to the upstream's wire format (rotating keys on
//! failure) and records usage for later selections and the admin API.
//!
//! # Architecture
//!
//! - [`core`]: configuration, errors, logging, metrics, middleware, rate limits
//! - [`store`]: the [`store::UsageStore`] trait and its backends
//! - [`providers`]: the [`providers::Provider`] trait and upstream adapters
//! - [`services`]: registry, model resolver, key selector, usage recorder
//! - [`api`]: HTTP handlers, streaming, auth, admin API and the router
//!
//! # Configuration
//!
//! A YAML file (`--config`, default `config.yaml`, overridden by
//! `CONFIG_PATH`). `PORT` overrides `server.listen`.

pub mod api;
pub mod core;
pub mod providers;
pub mod services;
pub mod store;

use anyhow::Context;
use std::sync::Arc;

// Re-export commonly used types for convenience
pub use api::{build_router, AppState};
pub use core::{AppError, GatewayConfig, Result};
pub use services::{ProviderRegistry, Selector, UsageRecorder};

/// Connect the usage store and register every provider adapter.
pub async fn build_state(config: GatewayConfig) -> anyhow::Result<Arc<AppState>> {
    let store = store::connect_store(&config.storage.runtime)
        .await
        .with_context(|| {
            format!(
                "Failed to connect {} usage store",
                config.storage.runtime.store_type
            )
        })?;

    let registry = ProviderRegistry::from_config(&config, store.clone())?;
    Ok(Arc::new(AppState::new(config, registry, store)))
}
