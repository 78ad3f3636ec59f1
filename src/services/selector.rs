//! Key selection: resolve the client model, then rank the provider's keys by
//! the configured strategy and take the first one with rate-limit capacity.

use super::resolver::{ModelResolver, ResolveError};
use crate::core::config::{GatewayConfig, HybridWeights, KeyConfig, PolicyConfig, ProviderConfig, Strategy};
use crate::core::metrics::get_metrics;
use crate::core::rate_limiter::KeyRateLimiter;
use crate::store::{SharedStore, UsageMetric};
use rand::seq::SliceRandom;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SelectError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("no API key available for provider '{0}'")]
    NoKeyAvailable(String),
}

/// Outcome of a selection.
#[derive(Debug, Clone)]
pub struct Selection {
    pub provider: Arc<ProviderConfig>,
    pub key_index: usize,
    pub upstream_model: String,
}

impl Selection {
    pub fn key(&self) -> &KeyConfig {
        &self.provider.keys[self.key_index]
    }
}

/// Live counters that feed the hybrid score.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct KeyUsage {
    pub req: f64,
    pub tokens: f64,
    pub errors: f64,
    pub latency: f64,
}

/// Lower is better. The cost term is the key's combined per-1000-token price.
pub fn hybrid_score(weights: &HybridWeights, usage: &KeyUsage, key: &KeyConfig) -> f64 {
    weights.req_ratio * usage.req
        + weights.token_ratio * usage.tokens
        + weights.error_score * usage.errors
        + weights.latency * usage.latency
        + weights.cost_ratio * key.unit_cost()
}

pub struct Selector {
    providers: HashMap<String, Arc<ProviderConfig>>,
    resolver: ModelResolver,
    policy: PolicyConfig,
    store: SharedStore,
    limiter: Arc<KeyRateLimiter>,
}

impl Selector {
    pub fn new(config: &GatewayConfig, store: SharedStore, limiter: Arc<KeyRateLimiter>) -> Self {
        Self {
            providers: config
                .providers
                .iter()
                .map(|p| (p.id.clone(), Arc::new(p.clone())))
                .collect(),
            resolver: ModelResolver::new(config),
            policy: config.policy.clone(),
            store,
            limiter,
        }
    }

    pub fn resolver(&self) -> &ModelResolver {
        &self.resolver
    }

    /// Resolve `client_model` and pick a key of the owning provider.
    pub async fn select_best(&self, client_model: &str) -> Result<Selection, SelectError> {
        let resolved = self.resolver.resolve(client_model)?;
        let provider = self
            .providers
            .get(&resolved.provider_id)
            .cloned()
            .ok_or_else(|| ResolveError::UnknownProvider {
                model: client_model.to_string(),
                provider: resolved.provider_id.clone(),
            })?;

        let ranked = self.rank_keys(&provider).await;
        let key_index = ranked
            .into_iter()
            .find(|&i| self.limiter.try_acquire(&provider.id, &provider.keys[i].id))
            .ok_or_else(|| SelectError::NoKeyAvailable(provider.id.clone()))?;

        let key = &provider.keys[key_index];
        tracing::debug!(
            provider = %provider.id,
            key = %key.id,
            strategy = self.policy.strategy.as_str(),
            upstream_model = %resolved.upstream_model,
            "Key selected"
        );
        get_metrics()
            .key_selections
            .with_label_values(&[provider.id.as_str(), key.id.as_str(), self.policy.strategy.as_str()])
            .inc();

        Ok(Selection {
            provider,
            key_index,
            upstream_model: resolved.upstream_model,
        })
    }

    /// Key indices, best first.
    async fn rank_keys(&self, provider: &ProviderConfig) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..provider.keys.len()).collect();
        match self.policy.strategy {
            Strategy::RoundRobin => {
                indices.shuffle(&mut rand::thread_rng());
                indices
            }
            Strategy::LeastError => {
                let mut scored = Vec::with_capacity(indices.len());
                for i in indices {
                    let errors = self
                        .read_usage(&provider.id, &provider.keys[i].id, UsageMetric::Errors)
                        .await;
                    scored.push((i, errors));
                }
                sort_by_score(scored)
            }
            Strategy::Hybrid => {
                if self.policy.cost_first {
                    let cheapest = provider
                        .keys
                        .iter()
                        .map(KeyConfig::unit_cost)
                        .fold(f64::INFINITY, f64::min);
                    indices.retain(|&i| provider.keys[i].unit_cost() <= cheapest);
                }
                let mut scored = Vec::with_capacity(indices.len());
                for i in indices {
                    let key = &provider.keys[i];
                    let usage = self.key_usage(&provider.id, &key.id).await;
                    scored.push((i, hybrid_score(&self.policy.hybrid_weights, &usage, key)));
                }
                sort_by_score(scored)
            }
        }
    }

    /// Reads only the counters whose weight is non-zero.
    async fn key_usage(&self, provider: &str, key: &str) -> KeyUsage {
        let w = &self.policy.hybrid_weights;
        let mut usage = KeyUsage::default();
        if w.req_ratio > 0.0 {
            usage.req = self.read_usage(provider, key, UsageMetric::Req).await;
        }
        if w.token_ratio > 0.0 {
            usage.tokens = self.read_usage(provider, key, UsageMetric::Tokens).await;
        }
        if w.error_score > 0.0 {
            usage.errors = self.read_usage(provider, key, UsageMetric::Errors).await;
        }
        if w.latency > 0.0 {
            usage.latency = self.read_usage(provider, key, UsageMetric::Latency).await;
        }
        usage
    }

    async fn read_usage(&self, provider: &str, key: &str, metric: UsageMetric) -> f64 {
        match self.store.get_usage(provider, key, metric).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(
                    provider,
                    key,
                    metric = metric.as_str(),
                    error = %e,
                    "Usage read failed during selection, treating as 0"
                );
                get_metrics()
                    .store_errors
                    .with_label_values(&[self.store.backend(), "get_usage"])
                    .inc();
                0.0
            }
        }
    }
}

/// Stable ascending sort, so ties keep declaration order.
fn sort_by_score(mut scored: Vec<(usize, f64)>) -> Vec<usize> {
    scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
    scored.into_iter().map(|(i, _)| i).collect()
}
