//! Per-upstream-key rate limiting.
//!
//! Each key with `limit_req_per_min` / `limit_tokens_per_min` gets token
//! buckets from the governor crate. The selector asks [`KeyRateLimiter::try_acquire`]
//! before committing to a key; token budgets are debited once the upstream
//! reported how many tokens a request consumed.

use dashmap::DashMap;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::core::config::ProviderConfig;

type Bucket = Arc<GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

#[derive(Clone, Default)]
struct KeyBuckets {
    requests: Option<Bucket>,
    tokens: Option<(Bucket, NonZeroU32)>,
}

fn per_minute(limit: u32) -> Option<(Bucket, NonZeroU32)> {
    let limit = NonZeroU32::new(limit)?;
    Some((Arc::new(GovernorRateLimiter::direct(Quota::per_minute(limit))), limit))
}

fn bucket_id(provider: &str, key: &str) -> String {
    format!("{}/{}", provider, key)
}

/// Rate limiter over `(provider, key)` pairs. Keys without limits always pass.
#[derive(Default)]
pub struct KeyRateLimiter {
    buckets: DashMap<String, KeyBuckets>,
}

impl KeyRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_providers(providers: &[ProviderConfig]) -> Self {
        let limiter = Self::new();
        for provider in providers {
            for key in &provider.keys {
                limiter.register_key(
                    &provider.id,
                    &key.id,
                    key.limit_req_per_min,
                    key.limit_tokens_per_min,
                );
            }
        }
        limiter
    }

    /// Register (or replace) the limits of one key. A limit of 0 is treated as unset.
    pub fn register_key(
        &self,
        provider: &str,
        key: &str,
        req_per_min: Option<u32>,
        tokens_per_min: Option<u32>,
    ) {
        let buckets = KeyBuckets {
            requests: req_per_min.and_then(per_minute).map(|(bucket, _)| bucket),
            tokens: tokens_per_min.and_then(per_minute),
        };
        if buckets.requests.is_none() && buckets.tokens.is_none() {
            self.buckets.remove(&bucket_id(provider, key));
            return;
        }
        self.buckets.insert(bucket_id(provider, key), buckets);
    }

    /// Take one request slot if the key has both request and token capacity.
    pub fn try_acquire(&self, provider: &str, key: &str) -> bool {
        let Some(buckets) = self.buckets.get(&bucket_id(provider, key)) else {
            return true;
        };
        if let Some((tokens, _)) = &buckets.tokens {
            if tokens.check().is_err() {
                tracing::debug!(provider, key, "Token budget exhausted");
                return false;
            }
        }
        if let Some(requests) = &buckets.requests {
            if requests.check().is_err() {
                tracing::debug!(provider, key, "Request budget exhausted");
                return false;
            }
        }
        true
    }

    /// Debit `tokens` from the key's token budget, draining it when the
    /// request used more than what is left.
    pub fn consume_tokens(&self, provider: &str, key: &str, tokens: u64) {
        let Some(buckets) = self.buckets.get(&bucket_id(provider, key)) else {
            return;
        };
        let Some((bucket, capacity)) = &buckets.tokens else {
            return;
        };
        let wanted = u32::try_from(tokens).unwrap_or(u32::MAX).min(capacity.get());
        let Some(wanted) = NonZeroU32::new(wanted) else {
            return;
        };
        if !matches!(bucket.check_n(wanted), Ok(Ok(()))) {
            while bucket.check().is_ok() {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{KeyConfig, ProviderType};

    #[test]
    fn test_unlimited_key_always_passes() {
        let limiter = KeyRateLimiter::new();
        for _ in 0..100 {
            assert!(limiter.try_acquire("openai", "k1"));
        }
    }

    #[test]
    fn test_request_limit_blocks_after_budget() {
        let limiter = KeyRateLimiter::new();
        limiter.register_key("openai", "k1", Some(3), None);

        for _ in 0..3 {
            assert!(limiter.try_acquire("openai", "k1"));
        }
        assert!(!limiter.try_acquire("openai", "k1"));
        assert!(limiter.try_acquire("openai", "k2"));
    }

    #[test]
    fn test_token_budget_debited_after_response() {
        let limiter = KeyRateLimiter::new();
        limiter.register_key("openai", "k1", None, Some(100));

        assert!(limiter.try_acquire("openai", "k1"));
        limiter.consume_tokens("openai", "k1", 5_000);
        assert!(!limiter.try_acquire("openai", "k1"));
    }

    #[test]
    fn test_zero_limits_are_unset() {
        let limiter = KeyRateLimiter::new();
        limiter.register_key("openai", "k1", Some(0), Some(0));
        for _ in 0..10 {
            assert!(limiter.try_acquire("openai", "k1"));
        }
    }

    #[test]
    fn test_from_providers_registers_each_key() {
        let provider = ProviderConfig {
            id: "p".into(),
            provider_type: ProviderType::Openai,
            base_url: None,
            model: None,
            timeout_secs: None,
            models: vec![],
            keys: vec![
                KeyConfig {
                    id: "limited".into(),
                    limit_req_per_min: Some(1),
                    ..Default::default()
                },
                KeyConfig {
                    id: "free".into(),
                    ..Default::default()
                },
            ],
        };
        let limiter = KeyRateLimiter::from_providers(&[provider]);
        assert!(limiter.try_acquire("p", "limited"));
        assert!(!limiter.try_acquire("p", "limited"));
        assert!(limiter.try_acquire("p", "free"));
        assert!(limiter.try_acquire("p", "free"));
    }
}
