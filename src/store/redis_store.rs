//! Redis usage store.
//!
//! Counters are plain float strings advanced with `INCRBYFLOAT`. Each
//! increment also adds a member `"{ts}:{delta}:{nonce}"` to a per-counter
//! sorted set scored by timestamp, and both commands go out as one
//! `MULTI`/`EXEC` pipeline. Metric points are JSON members of a sorted set
//! per metric name.

use super::{now_secs, MetricPoint, StoreError, StoreResult, UsageMetric, UsageStore};
use crate::core::config::RuntimeStorage;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const BACKEND: &str = "redis";

pub struct RedisStore {
    conn: MultiplexedConnection,
    usage_prefix: String,
    history_prefix: String,
    cache_prefix: String,
    metrics_prefix: String,
}

#[derive(Serialize, Deserialize)]
struct StoredPoint {
    id: String,
    #[serde(flatten)]
    point: MetricPoint,
}

impl RedisStore {
    /// Open a multiplexed connection. `url`/`addr` may be a full
    /// `redis://` URL or a bare `host:port`.
    pub async fn connect(config: &RuntimeStorage) -> StoreResult<Self> {
        let url = redis_url(config)?;
        let client = redis::Client::open(url.as_str())
            .map_err(|e| StoreError::Config(format!("invalid redis address: {}", e)))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Connection(format!("redis: {}", e)))?;

        tracing::debug!(url = %redact_url(&url), "Redis usage store connected");

        Ok(Self {
            conn,
            usage_prefix: config.table_usage.clone(),
            history_prefix: config.table_history.clone(),
            cache_prefix: config.table_cache.clone(),
            metrics_prefix: config.table_metrics.clone(),
        })
    }

    fn usage_key(&self, provider: &str, key: &str, metric: UsageMetric) -> String {
        format!("{}:{}:{}:{}", self.usage_prefix, provider, key, metric)
    }

    fn history_key(&self, provider: &str, key: &str, metric: UsageMetric) -> String {
        format!("{}:{}:{}:{}", self.history_prefix, provider, key, metric)
    }

    fn cache_key(&self, key: &str) -> String {
        format!("{}:{}", self.cache_prefix, key)
    }

    fn metrics_key(&self, name: &str) -> String {
        format!("{}:{}", self.metrics_prefix, name)
    }
}

fn redis_url(config: &RuntimeStorage) -> StoreResult<String> {
    let endpoint = config
        .endpoint()
        .ok_or_else(|| StoreError::Config("redis store requires 'addr' or 'url'".into()))?;

    if endpoint.starts_with("redis://") || endpoint.starts_with("rediss://") {
        return Ok(endpoint.to_string());
    }

    let db = config.database.as_deref().unwrap_or("0");
    Ok(match config.password.as_deref() {
        Some(password) if !password.is_empty() => {
            format!("redis://:{}@{}/{}", password, endpoint, db)
        }
        _ => format!("redis://{}/{}", endpoint, db),
    })
}

fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}***{}", &url[..scheme_end + 3], &url[at..])
        }
        _ => url.to_string(),
    }
}

fn history_member(timestamp: i64, delta: f64) -> String {
    format!("{}:{}:{}", timestamp, delta, uuid::Uuid::new_v4().simple())
}

fn member_delta(member: &str) -> Option<f64> {
    member.split(':').nth(1)?.parse().ok()
}

fn redis_err(err: redis::RedisError) -> StoreError {
    StoreError::backend(BACKEND, err)
}

#[async_trait]
impl UsageStore for RedisStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn get_usage(&self, provider: &str, key: &str, metric: UsageMetric) -> StoreResult<f64> {
        let mut conn = self.conn.clone();
        let value: Option<f64> = redis::cmd("GET")
            .arg(self.usage_key(provider, key, metric))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(value.unwrap_or(0.0))
    }

    async fn set_usage(
        &self,
        provider: &str,
        key: &str,
        metric: UsageMetric,
        value: f64,
    ) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(self.usage_key(provider, key, metric))
            .arg(value)
            .query_async::<()>(&mut conn)
            .await
            .map_err(redis_err)
    }

    async fn increment_usage(
        &self,
        provider: &str,
        key: &str,
        metric: UsageMetric,
        delta: f64,
    ) -> StoreResult<()> {
        let now = now_secs();
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(self.history_key(provider, key, metric))
            .arg(now)
            .arg(history_member(now, delta))
            .ignore()
            .cmd("INCRBYFLOAT")
            .arg(self.usage_key(provider, key, metric))
            .arg(delta)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(redis_err)
    }

    async fn get_usage_in_window(
        &self,
        provider: &str,
        key: &str,
        metric: UsageMetric,
        window_secs: u64,
    ) -> StoreResult<f64> {
        let since = super::window_start(window_secs);
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.history_key(provider, key, metric))
            .arg(format!("({}", since))
            .arg("+inf")
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        Ok(members.iter().filter_map(|m| member_delta(m)).sum())
    }

    async fn set_cache(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.cache_key(key)).arg(value);
        if ttl_secs > 0 {
            cmd.arg("EX").arg(ttl_secs);
        }
        cmd.query_async::<()>(&mut conn).await.map_err(redis_err)
    }

    async fn get_cache(&self, key: &str) -> StoreResult<String> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(self.cache_key(key))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(value.unwrap_or_default())
    }

    async fn store_metric(
        &self,
        name: &str,
        value: f64,
        tags: &HashMap<String, String>,
        timestamp: i64,
    ) -> StoreResult<()> {
        let stored = StoredPoint {
            id: uuid::Uuid::new_v4().simple().to_string(),
            point: MetricPoint {
                name: name.to_string(),
                tags: tags.clone(),
                value,
                timestamp,
            },
        };
        let member = serde_json::to_string(&stored)
            .map_err(|e| StoreError::InvalidData(e.to_string()))?;

        let mut conn = self.conn.clone();
        redis::cmd("ZADD")
            .arg(self.metrics_key(name))
            .arg(timestamp)
            .arg(member)
            .query_async::<()>(&mut conn)
            .await
            .map_err(redis_err)
    }

    async fn get_metrics(
        &self,
        name: &str,
        tag_filter: &HashMap<String, String>,
        start: i64,
        end: i64,
    ) -> StoreResult<Vec<MetricPoint>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.metrics_key(name))
            .arg(start)
            .arg(end)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        let mut points = Vec::with_capacity(members.len());
        for member in members {
            match serde_json::from_str::<StoredPoint>(&member) {
                Ok(stored) if stored.point.matches(tag_filter) => points.push(stored.point),
                Ok(_) => {}
                Err(e) => tracing::warn!(metric = name, error = %e, "Skipping malformed metric point"),
            }
        }
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(addr: &str) -> RuntimeStorage {
        RuntimeStorage {
            store_type: crate::core::config::StoreType::Redis,
            addr: Some(addr.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_redis_url_from_addr() {
        assert_eq!(
            redis_url(&storage("localhost:6379")).unwrap(),
            "redis://localhost:6379/0"
        );

        let mut config = storage("cache:6380");
        config.password = Some("hunter2".into());
        config.database = Some("3".into());
        assert_eq!(redis_url(&config).unwrap(), "redis://:hunter2@cache:6380/3");

        let mut config = storage("ignored:1");
        config.url = Some("rediss://secure:6379/1".into());
        assert_eq!(redis_url(&config).unwrap(), "rediss://secure:6379/1");
    }

    #[test]
    fn test_redis_url_requires_endpoint() {
        let config = RuntimeStorage {
            store_type: crate::core::config::StoreType::Redis,
            ..Default::default()
        };
        assert!(matches!(redis_url(&config), Err(StoreError::Config(_))));
    }

    #[test]
    fn test_redact_url_hides_password() {
        assert_eq!(
            redact_url("redis://:hunter2@cache:6380/3"),
            "redis://***@cache:6380/3"
        );
        assert_eq!(redact_url("redis://cache:6380/0"), "redis://cache:6380/0");
    }

    #[test]
    fn test_history_members_are_unique_and_parse() {
        let a = history_member(100, 2.5);
        let b = history_member(100, 2.5);
        assert_ne!(a, b);
        assert_eq!(member_delta(&a), Some(2.5));
        assert_eq!(member_delta("garbage"), None);
    }

    #[tokio::test]
    #[ignore = "requires a running redis at REDIS_URL"]
    async fn test_redis_round_trip() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/15".into());
        let mut config = storage("unused");
        config.url = Some(url);
        let store = RedisStore::connect(&config).await.unwrap();

        let provider = format!("test-{}", uuid::Uuid::new_v4().simple());
        store
            .increment_usage(&provider, "k1", UsageMetric::Tokens, 7.0)
            .await
            .unwrap();
        store
            .increment_usage(&provider, "k1", UsageMetric::Tokens, 3.0)
            .await
            .unwrap();
        assert_eq!(
            store.get_usage(&provider, "k1", UsageMetric::Tokens).await.unwrap(),
            10.0
        );
        assert_eq!(
            store
                .get_usage_in_window(&provider, "k1", UsageMetric::Tokens, 60)
                .await
                .unwrap(),
            10.0
        );

        store.set_cache(&provider, "cached", 30).await.unwrap();
        assert_eq!(store.get_cache(&provider).await.unwrap(), "cached");
    }
}
