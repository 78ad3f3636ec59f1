//! Per-provider key pool with least-loaded first pick and round-robin retry.

use super::{ProviderError, ProviderResult};
use crate::core::config::KeyConfig;
use crate::core::logging::{get_client_key_name, get_request_id};
use crate::core::metrics::get_metrics;
use crate::store::{SharedStore, UsageMetric};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Upper bound on upstream calls per client request.
pub const MAX_ATTEMPTS: u32 = 3;

pub struct KeyPool {
    provider_id: String,
    keys: Vec<Arc<KeyConfig>>,
    cursor: AtomicUsize,
    store: SharedStore,
}

impl KeyPool {
    pub fn new(provider_id: &str, keys: &[KeyConfig], store: SharedStore) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            keys: keys.iter().cloned().map(Arc::new).collect(),
            cursor: AtomicUsize::new(0),
            store,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn get(&self, key_id: &str) -> Option<Arc<KeyConfig>> {
        self.keys.iter().find(|k| k.id == key_id).cloned()
    }

    /// Key with the smallest `req` counter; ties go to declaration order.
    /// Unreadable counters count as zero.
    pub async fn select_least_loaded(&self) -> Option<Arc<KeyConfig>> {
        let mut best: Option<(f64, &Arc<KeyConfig>)> = None;
        for key in &self.keys {
            let load = match self
                .store
                .get_usage(&self.provider_id, &key.id, UsageMetric::Req)
                .await
            {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(
                        provider = %self.provider_id,
                        key = %key.id,
                        error = %e,
                        "Usage read failed, treating key load as 0"
                    );
                    get_metrics()
                        .store_errors
                        .with_label_values(&[self.store.backend(), "get_usage"])
                        .inc();
                    0.0
                }
            };
            if best.map_or(true, |(best_load, _)| load < best_load) {
                best = Some((load, key));
            }
        }
        best.map(|(_, key)| key.clone())
    }

    /// Advance the shared cursor and return the key under it.
    pub fn next_round_robin(&self) -> Option<Arc<KeyConfig>> {
        if self.keys.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.keys.len();
        Some(self.keys[index].clone())
    }

    /// Round-robin pick that skips keys already tried while untried ones remain.
    fn next_untried(&self, tried: &[String]) -> Option<Arc<KeyConfig>> {
        let mut fallback = None;
        for _ in 0..self.keys.len() {
            let key = self.next_round_robin()?;
            if !tried.contains(&key.id) {
                return Some(key);
            }
            fallback.get_or_insert(key);
        }
        fallback
    }

    /// Run `call` with up to [`MAX_ATTEMPTS`] keys.
    ///
    /// The first attempt uses `preferred` when it names a pool key, otherwise
    /// the least-loaded key; later attempts rotate. Local failures
    /// (unsupported capability, invalid request) are returned immediately.
    pub async fn execute<T, F, Fut>(&self, preferred: Option<&str>, mut call: F) -> ProviderResult<T>
    where
        F: FnMut(Arc<KeyConfig>) -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let metrics = get_metrics();
        let mut tried: Vec<String> = Vec::with_capacity(MAX_ATTEMPTS as usize);
        let mut last_error = None;

        for attempt in 0..MAX_ATTEMPTS {
            let key = if attempt == 0 {
                match preferred.and_then(|id| self.get(id)) {
                    Some(key) => Some(key),
                    None => self.select_least_loaded().await,
                }
            } else {
                self.next_untried(&tried)
            };
            let Some(key) = key else {
                return Err(ProviderError::NoKeyAvailable(self.provider_id.clone()));
            };

            tried.push(key.id.clone());
            let started = Instant::now();
            let outcome = call(key.clone()).await;
            metrics
                .provider_latency
                .with_label_values(&[self.provider_id.as_str()])
                .observe(started.elapsed().as_secs_f64());

            match outcome {
                Ok(value) => {
                    metrics
                        .upstream_attempts
                        .with_label_values(&[self.provider_id.as_str(), "success"])
                        .inc();
                    return Ok(value);
                }
                Err(e) if e.is_local() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        request_id = %get_request_id(),
                        client_key = %get_client_key_name(),
                        provider = %self.provider_id,
                        key = %key.id,
                        attempt = attempt + 1,
                        error = %e,
                        "Upstream call failed"
                    );
                    metrics
                        .upstream_attempts
                        .with_label_values(&[self.provider_id.as_str(), "failed"])
                        .inc();
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(last) => Err(ProviderError::Exhausted {
                provider: self.provider_id.clone(),
                attempts: MAX_ATTEMPTS,
                last: Box::new(last),
            }),
            None => Err(ProviderError::NoKeyAvailable(self.provider_id.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, UsageStore};
    use std::sync::Mutex;

    fn keys(ids: &[&str]) -> Vec<KeyConfig> {
        ids.iter()
            .map(|id| KeyConfig {
                id: id.to_string(),
                secret: format!("sk-{}", id),
                ..Default::default()
            })
            .collect()
    }

    fn pool(ids: &[&str]) -> (KeyPool, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (KeyPool::new("openai", &keys(ids), store.clone()), store)
    }

    #[tokio::test]
    async fn test_least_loaded_prefers_smallest_req_then_declaration_order() {
        let (pool, store) = pool(&["k1", "k2", "k3"]);
        assert_eq!(pool.select_least_loaded().await.unwrap().id, "k1");

        store.increment_usage("openai", "k1", UsageMetric::Req, 5.0).await.unwrap();
        store.increment_usage("openai", "k2", UsageMetric::Req, 2.0).await.unwrap();
        store.increment_usage("openai", "k3", UsageMetric::Req, 2.0).await.unwrap();
        assert_eq!(pool.select_least_loaded().await.unwrap().id, "k2");
    }

    #[test]
    fn test_round_robin_cycles() {
        let (pool, _) = pool(&["a", "b"]);
        let ids: Vec<String> = (0..4).map(|_| pool.next_round_robin().unwrap().id.clone()).collect();
        assert_eq!(ids, vec!["a", "b", "a", "b"]);
    }

    #[tokio::test]
    async fn test_empty_pool_has_no_key() {
        let (pool, _) = pool(&[]);
        assert!(pool.select_least_loaded().await.is_none());
        let result: ProviderResult<()> = pool.execute(None, |_| async { Ok(()) }).await;
        assert!(matches!(result, Err(ProviderError::NoKeyAvailable(_))));
    }

    #[tokio::test]
    async fn test_retry_rotates_through_distinct_keys() {
        let (pool, _) = pool(&["k1", "k2", "k3"]);
        let seen = Mutex::new(Vec::new());

        let result = pool
            .execute(None, |key| {
                let attempt = {
                    let mut seen = seen.lock().unwrap();
                    seen.push(key.id.clone());
                    seen.len()
                };
                async move {
                    if attempt < 3 {
                        Err(ProviderError::Http {
                            status: 500,
                            message: "boom".into(),
                        })
                    } else {
                        Ok(key.id.clone())
                    }
                }
            })
            .await
            .unwrap();

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], "k1");
        let mut distinct = seen.clone();
        distinct.sort();
        distinct.dedup();
        assert_eq!(distinct.len(), 3);
        assert_eq!(result, seen[2]);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let (pool, _) = pool(&["k1", "k2"]);
        let calls = AtomicUsize::new(0);

        let err = pool
            .execute(None, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(ProviderError::Transport("connection refused".into()))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS as usize);
        assert!(err
            .to_string()
            .starts_with("openai API error after 3 attempts"));
        assert!(matches!(err, ProviderError::Exhausted { ref last, .. } if last.is_transport()));
    }

    #[tokio::test]
    async fn test_preferred_key_used_first_and_local_errors_not_retried() {
        let (pool, _) = pool(&["k1", "k2"]);
        let calls = AtomicUsize::new(0);

        let err = pool
            .execute(Some("k2"), |key| {
                calls.fetch_add(1, Ordering::SeqCst);
                assert_eq!(key.id, "k2");
                async { Err::<(), _>(ProviderError::InvalidRequest("bad".into())) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, ProviderError::InvalidRequest(_)));
    }
}
