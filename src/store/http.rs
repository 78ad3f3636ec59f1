//! Usage store backed by a remote HTTP service.
//!
//! Endpoints (JSON bodies, optional `Authorization: Bearer <api_key>`):
//!
//! - `GET  /usage/{provider}/{key}/{metric}` -> `{"value": f64}`; 404 reads as 0
//! - `PUT  /usage/{provider}/{key}/{metric}` <- `{"value": f64}`
//! - `POST /usage/{provider}/{key}/{metric}/increment` <- `{"delta": f64}`
//! - `GET  /usage/{provider}/{key}/{metric}/window?seconds=N` -> `{"value": f64}`;
//!   a 404 falls back to the lifetime total
//! - `PUT  /cache/{key}` <- `{"value": str, "ttl_secs": u64}`; `GET /cache/{key}`
//! - `POST /metrics` <- metric point; `GET /metrics?name&start&end` -> `[point]`
//!
//! The remote service owns atomicity of increments.

use super::{MetricPoint, StoreError, StoreResult, UsageMetric, UsageStore};
use crate::core::config::RuntimeStorage;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

const BACKEND: &str = "http";

pub struct HttpStore {
    client: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct ValueBody {
    value: f64,
}

#[derive(Deserialize)]
struct CacheBody {
    #[serde(default)]
    value: String,
}

#[derive(Serialize)]
struct MetricsQuery<'a> {
    name: &'a str,
    start: i64,
    end: i64,
}

impl HttpStore {
    pub fn new(config: &RuntimeStorage) -> StoreResult<Self> {
        let endpoint = config
            .endpoint()
            .ok_or_else(|| StoreError::Config("http store requires 'url' or 'addr'".into()))?;
        let base_url = Url::parse(endpoint)
            .map_err(|e| StoreError::Config(format!("invalid http store url '{}': {}", endpoint, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(StoreError::Config(format!(
                "http store url '{}' cannot be a base",
                endpoint
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| StoreError::Config(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.clone(),
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn usage_url(&self, provider: &str, key: &str, metric: UsageMetric, suffix: Option<&str>) -> Url {
        let mut segments = vec!["usage", provider, key, metric.as_str()];
        segments.extend(suffix);
        self.url(&segments)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> StoreResult<reqwest::Response> {
        self.authorized(builder)
            .send()
            .await
            .map_err(|e| StoreError::backend(BACKEND, e))
    }

    async fn expect_success(response: reqwest::Response) -> StoreResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        Err(StoreError::backend(
            BACKEND,
            format!("remote store returned {}: {}", status, text),
        ))
    }

    async fn read_value(&self, url: Url) -> StoreResult<Option<f64>> {
        let response = self.send(self.client.get(url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: ValueBody = Self::expect_success(response)
            .await?
            .json()
            .await
            .map_err(|e| StoreError::InvalidData(e.to_string()))?;
        Ok(Some(body.value))
    }
}

#[async_trait]
impl UsageStore for HttpStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn get_usage(&self, provider: &str, key: &str, metric: UsageMetric) -> StoreResult<f64> {
        Ok(self
            .read_value(self.usage_url(provider, key, metric, None))
            .await?
            .unwrap_or(0.0))
    }

    async fn set_usage(
        &self,
        provider: &str,
        key: &str,
        metric: UsageMetric,
        value: f64,
    ) -> StoreResult<()> {
        let url = self.usage_url(provider, key, metric, None);
        let response = self
            .send(self.client.put(url).json(&json!({ "value": value })))
            .await?;
        Self::expect_success(response).await.map(|_| ())
    }

    async fn increment_usage(
        &self,
        provider: &str,
        key: &str,
        metric: UsageMetric,
        delta: f64,
    ) -> StoreResult<()> {
        let url = self.usage_url(provider, key, metric, Some("increment"));
        let response = self
            .send(self.client.post(url).json(&json!({ "delta": delta })))
            .await?;
        Self::expect_success(response).await.map(|_| ())
    }

    async fn get_usage_in_window(
        &self,
        provider: &str,
        key: &str,
        metric: UsageMetric,
        window_secs: u64,
    ) -> StoreResult<f64> {
        let mut url = self.usage_url(provider, key, metric, Some("window"));
        url.query_pairs_mut()
            .append_pair("seconds", &window_secs.to_string());

        match self.read_value(url).await? {
            Some(value) => Ok(value),
            None => self.get_usage(provider, key, metric).await,
        }
    }

    async fn set_cache(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()> {
        let url = self.url(&["cache", key]);
        let response = self
            .send(
                self.client
                    .put(url)
                    .json(&json!({ "value": value, "ttl_secs": ttl_secs })),
            )
            .await?;
        Self::expect_success(response).await.map(|_| ())
    }

    async fn get_cache(&self, key: &str) -> StoreResult<String> {
        let response = self.send(self.client.get(self.url(&["cache", key]))).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(String::new());
        }
        let body: CacheBody = Self::expect_success(response)
            .await?
            .json()
            .await
            .map_err(|e| StoreError::InvalidData(e.to_string()))?;
        Ok(body.value)
    }

    async fn store_metric(
        &self,
        name: &str,
        value: f64,
        tags: &HashMap<String, String>,
        timestamp: i64,
    ) -> StoreResult<()> {
        let point = MetricPoint {
            name: name.to_string(),
            tags: tags.clone(),
            value,
            timestamp,
        };
        let response = self
            .send(self.client.post(self.url(&["metrics"])).json(&point))
            .await?;
        Self::expect_success(response).await.map(|_| ())
    }

    async fn get_metrics(
        &self,
        name: &str,
        tag_filter: &HashMap<String, String>,
        start: i64,
        end: i64,
    ) -> StoreResult<Vec<MetricPoint>> {
        let response = self
            .send(
                self.client
                    .get(self.url(&["metrics"]))
                    .query(&MetricsQuery { name, start, end }),
            )
            .await?;
        let points: Vec<MetricPoint> = Self::expect_success(response)
            .await?
            .json()
            .await
            .map_err(|e| StoreError::InvalidData(e.to_string()))?;

        Ok(points
            .into_iter()
            .filter(|p| p.name == name && p.timestamp >= start && p.timestamp <= end)
            .filter(|p| p.matches(tag_filter))
            .collect())
    }
}
