//! Relational usage store over `sqlx::AnyPool` (PostgreSQL or SQLite).
//!
//! Tables are created on connect when absent. Table names come from
//! `storage.runtime.table_*` and must be plain identifiers.

use super::{now_secs, MetricPoint, StoreError, StoreResult, UsageMetric, UsageStore};
use crate::core::config::RuntimeStorage;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use std::collections::HashMap;
use std::time::Duration;

const BACKEND: &str = "sql";

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));

/// Resolved table names
#[derive(Debug, Clone)]
struct Tables {
    usage: String,
    history: String,
    cache: String,
    metrics: String,
}

impl Tables {
    fn from_config(config: &RuntimeStorage) -> StoreResult<Self> {
        for name in [
            &config.table_usage,
            &config.table_history,
            &config.table_cache,
            &config.table_metrics,
        ] {
            if !IDENTIFIER_RE.is_match(name) {
                return Err(StoreError::Config(format!(
                    "invalid table name '{}'",
                    name
                )));
            }
        }
        Ok(Self {
            usage: config.table_usage.clone(),
            history: config.table_history.clone(),
            cache: config.table_cache.clone(),
            metrics: config.table_metrics.clone(),
        })
    }
}

pub struct SqlStore {
    pool: AnyPool,
    tables: Tables,
}

fn sql_err(err: sqlx::Error) -> StoreError {
    StoreError::backend(BACKEND, err)
}

impl SqlStore {
    pub async fn connect(config: &RuntimeStorage) -> StoreResult<Self> {
        let url = config
            .endpoint()
            .ok_or_else(|| StoreError::Config("sql store requires 'url' or 'addr'".into()))?;
        let tables = Tables::from_config(config)?;

        sqlx::any::install_default_drivers();

        // Every connection to `sqlite::memory:` is a fresh database, so keep exactly one alive.
        let in_memory = url.starts_with("sqlite::memory:") || url.contains("mode=memory");
        let options = if in_memory {
            AnyPoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            AnyPoolOptions::new()
                .max_connections(10)
                .acquire_timeout(Duration::from_secs(30))
                .idle_timeout(Duration::from_secs(600))
        };

        let pool = options
            .connect(url)
            .await
            .map_err(|e| StoreError::Connection(format!("sql: {}", e)))?;

        let store = Self { pool, tables };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> StoreResult<()> {
        let t = &self.tables;
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    provider_id TEXT NOT NULL,
                    key_id TEXT NOT NULL,
                    metric TEXT NOT NULL,
                    value DOUBLE PRECISION NOT NULL DEFAULT 0,
                    PRIMARY KEY (provider_id, key_id, metric)
                )",
                t.usage
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    provider_id TEXT NOT NULL,
                    key_id TEXT NOT NULL,
                    metric TEXT NOT NULL,
                    delta DOUBLE PRECISION NOT NULL,
                    ts BIGINT NOT NULL
                )",
                t.history
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{0}_lookup ON {0} (provider_id, key_id, metric, ts)",
                t.history
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    cache_key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    expires_at BIGINT NOT NULL
                )",
                t.cache
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    name TEXT NOT NULL,
                    tags TEXT NOT NULL,
                    value DOUBLE PRECISION NOT NULL,
                    ts BIGINT NOT NULL
                )",
                t.metrics
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{0}_name_ts ON {0} (name, ts)",
                t.metrics
            ),
        ];

        for statement in &statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(sql_err)?;
        }
        Ok(())
    }
}

#[async_trait]
impl UsageStore for SqlStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn get_usage(&self, provider: &str, key: &str, metric: UsageMetric) -> StoreResult<f64> {
        let value: Option<f64> = sqlx::query_scalar(&format!(
            "SELECT value FROM {} WHERE provider_id = $1 AND key_id = $2 AND metric = $3",
            self.tables.usage
        ))
        .bind(provider)
        .bind(key)
        .bind(metric.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(sql_err)?;
        Ok(value.unwrap_or(0.0))
    }

    async fn set_usage(
        &self,
        provider: &str,
        key: &str,
        metric: UsageMetric,
        value: f64,
    ) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO {0} (provider_id, key_id, metric, value) VALUES ($1, $2, $3, $4)
             ON CONFLICT (provider_id, key_id, metric) DO UPDATE SET value = EXCLUDED.value",
            self.tables.usage
        ))
        .bind(provider)
        .bind(key)
        .bind(metric.as_str())
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(sql_err)?;
        Ok(())
    }

    async fn increment_usage(
        &self,
        provider: &str,
        key: &str,
        metric: UsageMetric,
        delta: f64,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(sql_err)?;

        sqlx::query(&format!(
            "INSERT INTO {} (provider_id, key_id, metric, delta, ts) VALUES ($1, $2, $3, $4, $5)",
            self.tables.history
        ))
        .bind(provider)
        .bind(key)
        .bind(metric.as_str())
        .bind(delta)
        .bind(now_secs())
        .execute(&mut *tx)
        .await
        .map_err(sql_err)?;

        sqlx::query(&format!(
            "INSERT INTO {0} (provider_id, key_id, metric, value) VALUES ($1, $2, $3, $4)
             ON CONFLICT (provider_id, key_id, metric) DO UPDATE SET value = {0}.value + EXCLUDED.value",
            self.tables.usage
        ))
        .bind(provider)
        .bind(key)
        .bind(metric.as_str())
        .bind(delta)
        .execute(&mut *tx)
        .await
        .map_err(sql_err)?;

        tx.commit().await.map_err(sql_err)
    }

    async fn get_usage_in_window(
        &self,
        provider: &str,
        key: &str,
        metric: UsageMetric,
        window_secs: u64,
    ) -> StoreResult<f64> {
        let since = super::window_start(window_secs);
        let sum: Option<f64> = sqlx::query_scalar(&format!(
            "SELECT SUM(delta) FROM {} WHERE provider_id = $1 AND key_id = $2 AND metric = $3 AND ts > $4",
            self.tables.history
        ))
        .bind(provider)
        .bind(key)
        .bind(metric.as_str())
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(sql_err)?;
        Ok(sum.unwrap_or(0.0))
    }

    async fn set_cache(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()> {
        let expires_at = super::expiry_for(ttl_secs).unwrap_or(0);
        sqlx::query(&format!(
            "INSERT INTO {} (cache_key, value, expires_at) VALUES ($1, $2, $3)
             ON CONFLICT (cache_key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
            self.tables.cache
        ))
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(sql_err)?;
        Ok(())
    }

    async fn get_cache(&self, key: &str) -> StoreResult<String> {
        let row: Option<(String, i64)> = sqlx::query_as(&format!(
            "SELECT value, expires_at FROM {} WHERE cache_key = $1",
            self.tables.cache
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(sql_err)?;

        Ok(match row {
            Some((value, expires_at)) if expires_at == 0 || expires_at > now_secs() => value,
            _ => String::new(),
        })
    }

    async fn store_metric(
        &self,
        name: &str,
        value: f64,
        tags: &HashMap<String, String>,
        timestamp: i64,
    ) -> StoreResult<()> {
        let tags = serde_json::to_string(tags).map_err(|e| StoreError::InvalidData(e.to_string()))?;
        sqlx::query(&format!(
            "INSERT INTO {} (name, tags, value, ts) VALUES ($1, $2, $3, $4)",
            self.tables.metrics
        ))
        .bind(name)
        .bind(tags)
        .bind(value)
        .bind(timestamp)
        .execute(&self.pool)
        .await
        .map_err(sql_err)?;
        Ok(())
    }

    async fn get_metrics(
        &self,
        name: &str,
        tag_filter: &HashMap<String, String>,
        start: i64,
        end: i64,
    ) -> StoreResult<Vec<MetricPoint>> {
        let rows: Vec<(String, f64, i64)> = sqlx::query_as(&format!(
            "SELECT tags, value, ts FROM {} WHERE name = $1 AND ts >= $2 AND ts <= $3 ORDER BY ts",
            self.tables.metrics
        ))
        .bind(name)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(sql_err)?;

        let mut points = Vec::with_capacity(rows.len());
        for (tags, value, timestamp) in rows {
            let tags: HashMap<String, String> = match serde_json::from_str(&tags) {
                Ok(tags) => tags,
                Err(e) => {
                    tracing::warn!(metric = name, error = %e, "Skipping metric row with malformed tags");
                    continue;
                }
            };
            let point = MetricPoint {
                name: name.to_string(),
                tags,
                value,
                timestamp,
            };
            if point.matches(tag_filter) {
                points.push(point);
            }
        }
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::StoreType;

    async fn sqlite_store() -> SqlStore {
        let config = RuntimeStorage {
            store_type: StoreType::Sql,
            url: Some("sqlite::memory:".to_string()),
            ..Default::default()
        };
        SqlStore::connect(&config).await.unwrap()
    }

    #[test]
    fn test_rejects_unsafe_table_names() {
        let config = RuntimeStorage {
            table_usage: "usage; DROP TABLE x".into(),
            ..Default::default()
        };
        assert!(matches!(
            Tables::from_config(&config),
            Err(StoreError::Config(_))
        ));
        assert!(Tables::from_config(&RuntimeStorage::default()).is_ok());
    }

    #[tokio::test]
    async fn test_connect_requires_url() {
        let config = RuntimeStorage {
            store_type: StoreType::Sql,
            ..Default::default()
        };
        assert!(matches!(
            SqlStore::connect(&config).await,
            Err(StoreError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_increment_and_window() {
        let store = sqlite_store().await;

        assert_eq!(store.get_usage("openai", "k1", UsageMetric::Req).await.unwrap(), 0.0);
        assert_eq!(
            store
                .get_usage_in_window("openai", "k1", UsageMetric::Req, 60)
                .await
                .unwrap(),
            0.0
        );

        store.increment_usage("openai", "k1", UsageMetric::Req, 1.0).await.unwrap();
        store.increment_usage("openai", "k1", UsageMetric::Req, 1.0).await.unwrap();
        store.increment_usage("openai", "k1", UsageMetric::Tokens, 30.0).await.unwrap();

        assert_eq!(store.get_usage("openai", "k1", UsageMetric::Req).await.unwrap(), 2.0);
        assert_eq!(store.get_usage("openai", "k1", UsageMetric::Tokens).await.unwrap(), 30.0);
        assert_eq!(
            store
                .get_usage_in_window("openai", "k1", UsageMetric::Req, 60)
                .await
                .unwrap(),
            2.0
        );
    }

    #[tokio::test]
    async fn test_window_excludes_old_history() {
        let store = sqlite_store().await;
        store.increment_usage("p", "k", UsageMetric::Tokens, 5.0).await.unwrap();

        sqlx::query(&format!(
            "INSERT INTO {} (provider_id, key_id, metric, delta, ts) VALUES ($1, $2, $3, $4, $5)",
            store.tables.history
        ))
        .bind("p")
        .bind("k")
        .bind("tokens")
        .bind(100.0_f64)
        .bind(now_secs() - 3600)
        .execute(&store.pool)
        .await
        .unwrap();

        assert_eq!(
            store
                .get_usage_in_window("p", "k", UsageMetric::Tokens, 60)
                .await
                .unwrap(),
            5.0
        );
        assert_eq!(
            store
                .get_usage_in_window("p", "k", UsageMetric::Tokens, 7200)
                .await
                .unwrap(),
            105.0
        );
    }

    #[tokio::test]
    async fn test_unbounded_window_sums_all_history() {
        let store = sqlite_store().await;
        store.increment_usage("p", "k", UsageMetric::Req, 1.0).await.unwrap();
        store.increment_usage("p", "k", UsageMetric::Req, 2.0).await.unwrap();

        assert_eq!(
            store
                .get_usage_in_window("p", "k", UsageMetric::Req, u64::MAX)
                .await
                .unwrap(),
            3.0
        );
    }

    #[tokio::test]
    async fn test_set_usage_overwrites() {
        let store = sqlite_store().await;
        store.increment_usage("p", "k", UsageMetric::Errors, 3.0).await.unwrap();
        store.set_usage("p", "k", UsageMetric::Errors, 0.0).await.unwrap();
        assert_eq!(store.get_usage("p", "k", UsageMetric::Errors).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_cache_semantics() {
        let store = sqlite_store().await;
        assert_eq!(store.get_cache("models:openai").await.unwrap(), "");

        store.set_cache("models:openai", "[\"gpt-4\"]", 0).await.unwrap();
        assert_eq!(store.get_cache("models:openai").await.unwrap(), "[\"gpt-4\"]");

        store.set_cache("models:openai", "[]", 60).await.unwrap();
        assert_eq!(store.get_cache("models:openai").await.unwrap(), "[]");

        sqlx::query(&format!(
            "UPDATE {} SET expires_at = $1 WHERE cache_key = $2",
            store.tables.cache
        ))
        .bind(now_secs() - 1)
        .bind("models:openai")
        .execute(&store.pool)
        .await
        .unwrap();
        assert_eq!(store.get_cache("models:openai").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_metrics_range_and_tags() {
        let store = sqlite_store().await;
        let tags_a = HashMap::from([
            ("provider".to_string(), "openai".to_string()),
            ("key".to_string(), "k1".to_string()),
        ]);
        let tags_b = HashMap::from([
            ("provider".to_string(), "anthropic".to_string()),
            ("key".to_string(), "k9".to_string()),
        ]);

        store.store_metric("request_latency_ms", 10.0, &tags_a, 100).await.unwrap();
        store.store_metric("request_latency_ms", 20.0, &tags_b, 150).await.unwrap();
        store.store_metric("request_latency_ms", 30.0, &tags_a, 300).await.unwrap();
        store.store_metric("request_tokens", 99.0, &tags_a, 120).await.unwrap();

        let all = store
            .get_metrics("request_latency_ms", &HashMap::new(), 0, 200)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let openai = store
            .get_metrics(
                "request_latency_ms",
                &HashMap::from([("provider".to_string(), "openai".to_string())]),
                0,
                i64::MAX,
            )
            .await
            .unwrap();
        assert_eq!(
            openai.iter().map(|p| p.value).collect::<Vec<_>>(),
            vec![10.0, 30.0]
        );
        assert!(openai.iter().all(|p| p.name == "request_latency_ms"));
    }
}
