//! Client model name -> `(provider id, upstream model)` resolution.

use crate::core::config::{GatewayConfig, ProviderType};
use std::collections::BTreeMap;
use thiserror::Error;

/// Alias chains longer than this are treated as cycles.
const MAX_ALIAS_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub provider_id: String,
    pub upstream_model: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("model '{0}' not found")]
    NotFound(String),

    #[error("model '{model}' references unknown provider '{provider}'")]
    UnknownProvider { model: String, provider: String },

    #[error("alias chain for '{0}' is too deep")]
    AliasLoop(String),
}

#[derive(Debug, Clone, Default)]
pub struct ModelResolver {
    aliases: BTreeMap<String, String>,
    providers: Vec<(String, ProviderType)>,
    default_provider: Option<String>,
}

impl ModelResolver {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            aliases: config.model_aliases.clone(),
            providers: config
                .providers
                .iter()
                .map(|p| (p.id.clone(), p.provider_type))
                .collect(),
            default_provider: config.default_provider.clone(),
        }
    }

    /// Resolution order: explicit `provider:model`, alias table (recursively),
    /// provider type prefixes in declaration order, then `default_provider`.
    pub fn resolve(&self, model: &str) -> Result<ResolvedModel, ResolveError> {
        let mut current = model;
        for _ in 0..=MAX_ALIAS_DEPTH {
            if let Some((provider, upstream)) = current.split_once(':') {
                if !self.has_provider(provider) {
                    return Err(ResolveError::UnknownProvider {
                        model: model.to_string(),
                        provider: provider.to_string(),
                    });
                }
                return Ok(ResolvedModel {
                    provider_id: provider.to_string(),
                    upstream_model: upstream.to_string(),
                });
            }
            match self.aliases.get(current) {
                Some(target) => current = target,
                None => return self.fallback(current),
            }
        }
        Err(ResolveError::AliasLoop(model.to_string()))
    }

    fn fallback(&self, model: &str) -> Result<ResolvedModel, ResolveError> {
        let by_prefix = self.providers.iter().find(|(_, provider_type)| {
            provider_type
                .model_prefixes()
                .iter()
                .any(|prefix| model.starts_with(prefix))
        });
        let provider_id = by_prefix
            .map(|(id, _)| id.as_str())
            .or(self.default_provider.as_deref())
            .ok_or_else(|| ResolveError::NotFound(model.to_string()))?;
        Ok(ResolvedModel {
            provider_id: provider_id.to_string(),
            upstream_model: model.to_string(),
        })
    }

    fn has_provider(&self, id: &str) -> bool {
        self.providers.iter().any(|(pid, _)| pid == id)
    }

    /// Client-facing alias names, sorted.
    pub fn alias_names(&self) -> impl Iterator<Item = &str> {
        self.aliases.keys().map(String::as_str)
    }
}
