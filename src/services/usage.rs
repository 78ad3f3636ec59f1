//! Usage accounting posted after each request.
//!
//! Counters feed key selection; the `request_latency_ms` / `request_tokens`
//! metric points feed the admin statistics. Store failures are logged and
//! never fail the request that produced them.

use crate::core::config::KeyConfig;
use crate::core::metrics::get_metrics;
use crate::core::rate_limiter::KeyRateLimiter;
use crate::store::{now_secs, SharedStore, StoreResult, UsageMetric};
use std::collections::HashMap;
use std::sync::Arc;

pub const LATENCY_METRIC: &str = "request_latency_ms";
pub const TOKENS_METRIC: &str = "request_tokens";

/// Everything known about a finished (or failed) upstream request.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub client_key: String,
    pub provider: String,
    pub key: KeyConfig,
    pub model: String,
    pub status: u16,
    pub latency_ms: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl RequestOutcome {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    fn tags(&self) -> HashMap<String, String> {
        HashMap::from([
            ("client_key".to_string(), self.client_key.clone()),
            ("provider".to_string(), self.provider.clone()),
            ("key".to_string(), self.key.id.clone()),
            ("model".to_string(), self.model.clone()),
            ("status".to_string(), self.status.to_string()),
        ])
    }
}

#[derive(Clone)]
pub struct UsageRecorder {
    store: SharedStore,
    limiter: Arc<KeyRateLimiter>,
}

impl UsageRecorder {
    pub fn new(store: SharedStore, limiter: Arc<KeyRateLimiter>) -> Self {
        Self { store, limiter }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Thin pass-through to the store's atomic increment.
    pub async fn update_usage(
        &self,
        provider: &str,
        key: &str,
        metric: UsageMetric,
        delta: f64,
    ) -> StoreResult<()> {
        self.store.increment_usage(provider, key, metric, delta).await
    }

    /// Success: req, token and (when priced) cost counters, plus the latest
    /// latency sample.
    pub async fn record_success(&self, outcome: &RequestOutcome) {
        let key_id = outcome.key.id.as_str();
        let mut deltas = vec![
            (UsageMetric::Req, 1.0),
            (UsageMetric::Tokens, outcome.total_tokens() as f64),
            (UsageMetric::InputTokens, outcome.input_tokens as f64),
            (UsageMetric::OutputTokens, outcome.output_tokens as f64),
        ];
        let cost = outcome.key.cost_for(outcome.input_tokens, outcome.output_tokens);
        if cost > 0.0 {
            deltas.push((UsageMetric::Cost, cost));
        }
        for (metric, delta) in deltas {
            self.increment_logged(&outcome.provider, key_id, metric, delta).await;
        }
        if let Err(e) = self
            .store
            .set_usage(&outcome.provider, key_id, UsageMetric::Latency, outcome.latency_ms)
            .await
        {
            tracing::warn!(
                provider = %outcome.provider,
                key = key_id,
                error = %e,
                "Failed to record latency sample"
            );
            get_metrics()
                .store_errors
                .with_label_values(&[self.store.backend(), "set_usage"])
                .inc();
        }

        self.limiter
            .consume_tokens(&outcome.provider, key_id, outcome.total_tokens());

        let token_usage = &get_metrics().token_usage;
        token_usage
            .with_label_values(&[outcome.provider.as_str(), key_id, "input"])
            .inc_by(outcome.input_tokens);
        token_usage
            .with_label_values(&[outcome.provider.as_str(), key_id, "output"])
            .inc_by(outcome.output_tokens);

        self.store_points(outcome).await;
    }

    /// Failure (including client cancellation): only `errors` moves.
    pub async fn record_failure(&self, outcome: &RequestOutcome) {
        self.increment_logged(&outcome.provider, &outcome.key.id, UsageMetric::Errors, 1.0)
            .await;
        self.store_points(outcome).await;
    }

    /// Fire-and-forget failure recording for drop paths, which cannot await.
    pub fn spawn_failure(&self, outcome: RequestOutcome) {
        let recorder = self.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { recorder.record_failure(&outcome).await });
            }
            Err(_) => tracing::warn!(
                provider = %outcome.provider,
                key = %outcome.key.id,
                "No runtime available, dropping error increment"
            ),
        }
    }

    async fn increment_logged(&self, provider: &str, key: &str, metric: UsageMetric, delta: f64) {
        if let Err(e) = self.update_usage(provider, key, metric, delta).await {
            tracing::warn!(
                provider,
                key,
                metric = metric.as_str(),
                error = %e,
                "Failed to record usage"
            );
            get_metrics()
                .store_errors
                .with_label_values(&[self.store.backend(), "increment_usage"])
                .inc();
        }
    }

    async fn store_points(&self, outcome: &RequestOutcome) {
        let tags = outcome.tags();
        let now = now_secs();
        for (name, value) in [
            (LATENCY_METRIC, outcome.latency_ms),
            (TOKENS_METRIC, outcome.total_tokens() as f64),
        ] {
            if let Err(e) = self.store.store_metric(name, value, &tags, now).await {
                tracing::warn!(metric = name, error = %e, "Failed to store metric point");
                get_metrics()
                    .store_errors
                    .with_label_values(&[self.store.backend(), "store_metric"])
                    .inc();
            }
        }
    }
}
