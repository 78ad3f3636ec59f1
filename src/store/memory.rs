//! In-process usage store.
//!
//! Counters and cache entries live behind a reader-writer lock. There is no
//! history, so windowed reads return the lifetime total, and metric points
//! are not retained (`get_metrics` returns an empty list).

use super::{expiry_for, is_expired, MetricPoint, StoreResult, UsageMetric, UsageStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

type CounterKey = (String, String, UsageMetric);

#[derive(Default)]
struct MemoryState {
    counters: HashMap<CounterKey, f64>,
    cache: HashMap<String, (String, Option<i64>)>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter_key(provider: &str, key: &str, metric: UsageMetric) -> CounterKey {
        (provider.to_string(), key.to_string(), metric)
    }

    fn read_counter(&self, provider: &str, key: &str, metric: UsageMetric) -> f64 {
        // A poisoned lock only means a writer panicked mid-update of a plain map.
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .counters
            .get(&Self::counter_key(provider, key, metric))
            .copied()
            .unwrap_or(0.0)
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get_usage(&self, provider: &str, key: &str, metric: UsageMetric) -> StoreResult<f64> {
        Ok(self.read_counter(provider, key, metric))
    }

    async fn set_usage(
        &self,
        provider: &str,
        key: &str,
        metric: UsageMetric,
        value: f64,
    ) -> StoreResult<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state
            .counters
            .insert(Self::counter_key(provider, key, metric), value);
        Ok(())
    }

    async fn increment_usage(
        &self,
        provider: &str,
        key: &str,
        metric: UsageMetric,
        delta: f64,
    ) -> StoreResult<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        *state
            .counters
            .entry(Self::counter_key(provider, key, metric))
            .or_insert(0.0) += delta;
        Ok(())
    }

    async fn get_usage_in_window(
        &self,
        provider: &str,
        key: &str,
        metric: UsageMetric,
        _window_secs: u64,
    ) -> StoreResult<f64> {
        Ok(self.read_counter(provider, key, metric))
    }

    async fn set_cache(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state
            .cache
            .insert(key.to_string(), (value.to_string(), expiry_for(ttl_secs)));
        Ok(())
    }

    async fn get_cache(&self, key: &str) -> StoreResult<String> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        match state.cache.get(key) {
            Some((value, expires_at)) if !is_expired(*expires_at) => Ok(value.clone()),
            _ => Ok(String::new()),
        }
    }

    async fn store_metric(
        &self,
        _name: &str,
        _value: f64,
        _tags: &HashMap<String, String>,
        _timestamp: i64,
    ) -> StoreResult<()> {
        Ok(())
    }

    async fn get_metrics(
        &self,
        _name: &str,
        _tag_filter: &HashMap<String, String>,
        _start: i64,
        _end: i64,
    ) -> StoreResult<Vec<MetricPoint>> {
        Ok(Vec::new())
    }
}
