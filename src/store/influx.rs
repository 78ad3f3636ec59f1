//! InfluxDB usage store over the v1-compatible HTTP API (`/write`, `/query`).
//!
//! Influx has no atomic increment, so read-modify-write of counters is
//! serialised by a process-local mutex; that mutex also hands out strictly
//! increasing nanosecond timestamps so history points never overwrite each
//! other. Concurrent gateway processes sharing one database can lose updates.

use super::{now_secs, MetricPoint, StoreError, StoreResult, UsageMetric, UsageStore};
use crate::core::config::RuntimeStorage;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

const BACKEND: &str = "influxdb";
const DEFAULT_DATABASE: &str = "llm_gateway";
const NANOS_PER_SEC: i64 = 1_000_000_000;

pub struct InfluxStore {
    client: reqwest::Client,
    base_url: String,
    database: String,
    token: Option<String>,
    usage_measurement: String,
    history_measurement: String,
    cache_measurement: String,
    metrics_measurement: String,
    /// Last history timestamp written, in nanoseconds
    write_lock: Mutex<i64>,
    metric_seq: AtomicU64,
}

impl InfluxStore {
    pub async fn connect(config: &RuntimeStorage) -> StoreResult<Self> {
        let store = Self::new(config)?;

        let response = store
            .request(store.client.get(format!("{}/ping", store.base_url)))
            .send()
            .await
            .map_err(|e| StoreError::Connection(format!("influxdb: {}", e)))?;
        if !response.status().is_success() {
            return Err(StoreError::Connection(format!(
                "influxdb ping returned {}",
                response.status()
            )));
        }

        // Fails harmlessly on servers where the database already exists or
        // where the token lacks admin rights.
        if let Err(e) = store
            .query_raw(&format!("CREATE DATABASE \"{}\"", store.database), true)
            .await
        {
            tracing::debug!(error = %e, "CREATE DATABASE skipped");
        }

        Ok(store)
    }

    fn new(config: &RuntimeStorage) -> StoreResult<Self> {
        let endpoint = config
            .endpoint()
            .ok_or_else(|| StoreError::Config("influxdb store requires 'url' or 'addr'".into()))?;
        let base_url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", endpoint.trim_end_matches('/'))
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| StoreError::Config(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            database: config
                .database
                .clone()
                .unwrap_or_else(|| DEFAULT_DATABASE.to_string()),
            token: config.api_key.clone().or_else(|| config.password.clone()),
            usage_measurement: config.table_usage.clone(),
            history_measurement: config.table_history.clone(),
            cache_measurement: config.table_cache.clone(),
            metrics_measurement: config.table_metrics.clone(),
            write_lock: Mutex::new(0),
            metric_seq: AtomicU64::new(0),
        })
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.header("Authorization", format!("Token {}", token)),
            None => builder,
        }
    }

    async fn write_lines(&self, body: String) -> StoreResult<()> {
        let response = self
            .request(self.client.post(format!("{}/write", self.base_url)))
            .query(&[("db", self.database.as_str()), ("precision", "ns")])
            .body(body)
            .send()
            .await
            .map_err(|e| StoreError::backend(BACKEND, e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StoreError::backend(
                BACKEND,
                format!("write failed with {}: {}", status, text),
            ));
        }
        Ok(())
    }

    async fn query_raw(&self, q: &str, post: bool) -> StoreResult<Value> {
        let url = format!("{}/query", self.base_url);
        let params = [("db", self.database.as_str()), ("q", q), ("epoch", "s")];
        let builder = if post {
            self.client.post(url).query(&params)
        } else {
            self.client.get(url).query(&params)
        };

        let response = self
            .request(builder)
            .send()
            .await
            .map_err(|e| StoreError::backend(BACKEND, e))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StoreError::backend(
                BACKEND,
                format!("query failed with {}: {}", status, text),
            ));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| StoreError::InvalidData(format!("influxdb response: {}", e)))?;
        if let Some(err) = body.pointer("/results/0/error").and_then(Value::as_str) {
            return Err(StoreError::backend(BACKEND, err));
        }
        Ok(body)
    }

    /// Rows of the first series as column-name maps.
    async fn select(&self, q: &str) -> StoreResult<Vec<HashMap<String, Value>>> {
        let body = self.query_raw(q, false).await?;
        Ok(series_rows(&body))
    }

    async fn read_counter(&self, provider: &str, key: &str, metric: UsageMetric) -> StoreResult<f64> {
        let rows = self
            .select(&format!(
                "SELECT last(\"value\") AS value FROM \"{}\" WHERE {}",
                self.usage_measurement,
                counter_predicate(provider, key, metric)
            ))
            .await?;
        Ok(first_f64(&rows, "value"))
    }

    fn counter_line(&self, provider: &str, key: &str, metric: UsageMetric, value: f64, ts: i64) -> String {
        format!(
            "{},{} value={} {}",
            escape_key(&self.usage_measurement),
            counter_tags(provider, key, metric),
            float_field(value),
            ts
        )
    }

    fn next_timestamp(last: &mut i64) -> i64 {
        let now = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(now_secs() * NANOS_PER_SEC);
        let ts = now.max(*last + 1);
        *last = ts;
        ts
    }
}

fn series_rows(body: &Value) -> Vec<HashMap<String, Value>> {
    let Some(series) = body.pointer("/results/0/series/0") else {
        return Vec::new();
    };
    let columns: Vec<String> = series
        .get("columns")
        .and_then(Value::as_array)
        .map(|cols| {
            cols.iter()
                .map(|c| c.as_str().unwrap_or_default().to_string())
                .collect()
        })
        .unwrap_or_default();

    series
        .get("values")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(Value::as_array)
                .map(|row| columns.iter().cloned().zip(row.iter().cloned()).collect())
                .collect()
        })
        .unwrap_or_default()
}

fn first_f64(rows: &[HashMap<String, Value>], column: &str) -> f64 {
    rows.first()
        .and_then(|row| row.get(column))
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}

/// Escape a line-protocol measurement, tag key or tag value.
fn escape_key(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace(' ', "\\ ")
        .replace('=', "\\=")
}

/// Escape a line-protocol string field value.
fn escape_field(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Escape an InfluxQL single-quoted literal.
fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn float_field(v: f64) -> String {
    // A bare integer literal would create an integer field and conflict with later floats.
    if v.fract() == 0.0 && v.is_finite() {
        format!("{:.1}", v)
    } else {
        v.to_string()
    }
}

fn counter_tags(provider: &str, key: &str, metric: UsageMetric) -> String {
    format!(
        "provider={},key={},metric={}",
        escape_key(provider),
        escape_key(key),
        metric
    )
}

fn counter_predicate(provider: &str, key: &str, metric: UsageMetric) -> String {
    format!(
        "\"provider\" = {} AND \"key\" = {} AND \"metric\" = {}",
        quote_literal(provider),
        quote_literal(key),
        quote_literal(metric.as_str())
    )
}

#[async_trait]
impl UsageStore for InfluxStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn get_usage(&self, provider: &str, key: &str, metric: UsageMetric) -> StoreResult<f64> {
        self.read_counter(provider, key, metric).await
    }

    async fn set_usage(
        &self,
        provider: &str,
        key: &str,
        metric: UsageMetric,
        value: f64,
    ) -> StoreResult<()> {
        let mut last = self.write_lock.lock().await;
        let ts = Self::next_timestamp(&mut last);
        self.write_lines(self.counter_line(provider, key, metric, value, ts))
            .await
    }

    async fn increment_usage(
        &self,
        provider: &str,
        key: &str,
        metric: UsageMetric,
        delta: f64,
    ) -> StoreResult<()> {
        let mut last = self.write_lock.lock().await;
        let current = self.read_counter(provider, key, metric).await?;
        let ts = Self::next_timestamp(&mut last);

        // One write request carries both points; Influx applies a batch as a unit.
        let body = format!(
            "{}\n{},{} delta={} {}",
            self.counter_line(provider, key, metric, current + delta, ts),
            escape_key(&self.history_measurement),
            counter_tags(provider, key, metric),
            float_field(delta),
            ts
        );
        self.write_lines(body).await
    }

    async fn get_usage_in_window(
        &self,
        provider: &str,
        key: &str,
        metric: UsageMetric,
        window_secs: u64,
    ) -> StoreResult<f64> {
        // Windows reaching before the epoch are unbounded; InfluxQL durations overflow long before u64::MAX.
        let since = if super::window_start(window_secs) > 0 {
            format!(" AND time > now() - {}s", window_secs)
        } else {
            String::new()
        };
        let rows = self
            .select(&format!(
                "SELECT sum(\"delta\") AS total FROM \"{}\" WHERE {}{}",
                self.history_measurement,
                counter_predicate(provider, key, metric),
                since
            ))
            .await?;
        Ok(first_f64(&rows, "total"))
    }

    async fn set_cache(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()> {
        let expires_at = super::expiry_for(ttl_secs).unwrap_or(0);
        let mut last = self.write_lock.lock().await;
        let ts = Self::next_timestamp(&mut last);
        self.write_lines(format!(
            "{},cache_key={} value={},expires_at={}i {}",
            escape_key(&self.cache_measurement),
            escape_key(key),
            escape_field(value),
            expires_at,
            ts
        ))
        .await
    }

    async fn get_cache(&self, key: &str) -> StoreResult<String> {
        let rows = self
            .select(&format!(
                "SELECT \"value\", \"expires_at\" FROM \"{}\" WHERE \"cache_key\" = {} ORDER BY time DESC LIMIT 1",
                self.cache_measurement,
                quote_literal(key)
            ))
            .await?;

        let Some(row) = rows.first() else {
            return Ok(String::new());
        };
        let expires_at = row.get("expires_at").and_then(Value::as_i64).unwrap_or(0);
        if expires_at != 0 && expires_at <= now_secs() {
            return Ok(String::new());
        }
        Ok(row
            .get("value")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    async fn store_metric(
        &self,
        name: &str,
        value: f64,
        tags: &HashMap<String, String>,
        timestamp: i64,
    ) -> StoreResult<()> {
        let tags_json =
            serde_json::to_string(tags).map_err(|e| StoreError::InvalidData(e.to_string()))?;
        // Sub-second offset keeps points of the same second distinct.
        let seq = (self.metric_seq.fetch_add(1, Ordering::Relaxed) % NANOS_PER_SEC as u64) as i64;
        self.write_lines(format!(
            "{},name={} value={},tags={} {}",
            escape_key(&self.metrics_measurement),
            escape_key(name),
            float_field(value),
            escape_field(&tags_json),
            timestamp * NANOS_PER_SEC + seq
        ))
        .await
    }

    async fn get_metrics(
        &self,
        name: &str,
        tag_filter: &HashMap<String, String>,
        start: i64,
        end: i64,
    ) -> StoreResult<Vec<MetricPoint>> {
        let rows = self
            .select(&format!(
                "SELECT \"value\", \"tags\" FROM \"{}\" WHERE \"name\" = {} AND time >= {}s AND time < {}s",
                self.metrics_measurement,
                quote_literal(name),
                start,
                end.saturating_add(1)
            ))
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let tags = row
                    .get("tags")
                    .and_then(Value::as_str)
                    .and_then(|s| serde_json::from_str(s).ok())
                    .unwrap_or_default();
                Some(MetricPoint {
                    name: name.to_string(),
                    tags,
                    value: row.get("value")?.as_f64()?,
                    timestamp: row.get("time")?.as_i64()?,
                })
            })
            .filter(|point| point.matches(tag_filter))
            .collect())
    }
}
