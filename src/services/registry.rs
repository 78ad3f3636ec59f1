//! Provider registry: adapters built once at boot, keyed by provider id.

use crate::core::config::{GatewayConfig, ProviderConfig, ProviderType};
use crate::providers::{
    AnthropicProvider, CohereProvider, GeminiProvider, OpenAiCompatibleProvider, Provider,
    ProviderResult, ReplicateProvider, VoyageProvider,
};
use crate::store::SharedStore;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Build the adapter matching a provider's type tag.
pub fn build_adapter(config: &ProviderConfig, store: SharedStore) -> ProviderResult<Arc<dyn Provider>> {
    let adapter: Arc<dyn Provider> = match config.provider_type {
        ProviderType::Anthropic => Arc::new(AnthropicProvider::new(config, store)?),
        ProviderType::Gemini => Arc::new(GeminiProvider::new(config, store)?),
        ProviderType::Cohere => Arc::new(CohereProvider::new(config, store)?),
        ProviderType::Replicate => Arc::new(ReplicateProvider::new(config, store)?),
        ProviderType::Voyage => Arc::new(VoyageProvider::new(config, store)?),
        ProviderType::Openai
        | ProviderType::Mistral
        | ProviderType::Together
        | ProviderType::Openrouter
        | ProviderType::Huggingface
        | ProviderType::Grok
        | ProviderType::Custom => Arc::new(OpenAiCompatibleProvider::new(config, store)?),
    };
    Ok(adapter)
}

/// Immutable after construction; lookups need no locking.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn Provider>>,
    order: Vec<String>,
}

impl ProviderRegistry {
    pub fn from_config(config: &GatewayConfig, store: SharedStore) -> Result<Self> {
        let mut registry = Self::default();
        for provider in &config.providers {
            let adapter = build_adapter(provider, store.clone())
                .with_context(|| format!("Failed to register provider '{}'", provider.id))?;
            registry.insert(adapter);
            tracing::info!(
                provider = %provider.id,
                provider_type = %provider.provider_type,
                keys = provider.keys.len(),
                "Provider registered"
            );
        }
        Ok(registry)
    }

    /// Register an adapter under its own name, replacing any previous one.
    pub fn insert(&mut self, adapter: Arc<dyn Provider>) {
        let id = adapter.name().to_string();
        if self.adapters.insert(id.clone(), adapter).is_none() {
            self.order.push(id);
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Provider>> {
        self.adapters.get(id).cloned()
    }

    /// Provider ids in registration order.
    pub fn ids(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
