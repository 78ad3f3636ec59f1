//! Usage & metrics store abstraction.
//!
//! A [`UsageStore`] keeps per-(provider, key, metric) counters with an
//! append-only history used for windowed sums, a string cache with TTL, and
//! general-purpose tagged metric points. Backends are interchangeable under
//! the trait contract; the differences each backend is allowed are noted on
//! the backend types.

pub mod http;
pub mod influx;
pub mod memory;
pub mod redis_store;
pub mod sql;

#[cfg(feature = "store-dynamodb")]
pub mod dynamo;
#[cfg(feature = "store-mongodb")]
pub mod mongo;

use crate::core::config::{RuntimeStorage, StoreType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

pub use self::http::HttpStore;
pub use self::influx::InfluxStore;
pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;
pub use self::sql::SqlStore;

/// Usage counter names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageMetric {
    Req,
    Tokens,
    InputTokens,
    OutputTokens,
    Errors,
    Latency,
    Cost,
}

impl UsageMetric {
    pub const ALL: [UsageMetric; 7] = [
        UsageMetric::Req,
        UsageMetric::Tokens,
        UsageMetric::InputTokens,
        UsageMetric::OutputTokens,
        UsageMetric::Errors,
        UsageMetric::Latency,
        UsageMetric::Cost,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Req => "req",
            Self::Tokens => "tokens",
            Self::InputTokens => "input_tokens",
            Self::OutputTokens => "output_tokens",
            Self::Errors => "errors",
            Self::Latency => "latency",
            Self::Cost => "cost",
        }
    }
}

impl fmt::Display for UsageMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UsageMetric {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UsageMetric::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| StoreError::InvalidData(format!("unknown usage metric '{}'", s)))
    }
}

/// A tagged time-series sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub name: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    pub value: f64,
    /// Unix seconds
    pub timestamp: i64,
}

impl MetricPoint {
    /// Conjunctive equality over the filter's tags.
    pub fn matches(&self, tag_filter: &HashMap<String, String>) -> bool {
        tag_filter
            .iter()
            .all(|(k, v)| self.tags.get(k).is_some_and(|tv| tv == v))
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{backend} backend error: {message}")]
    Backend {
        backend: &'static str,
        message: String,
    },

    #[error("store connection failed: {0}")]
    Connection(String),

    #[error("invalid store data: {0}")]
    InvalidData(String),

    #[error("store configuration error: {0}")]
    Config(String),
}

impl StoreError {
    pub fn backend(backend: &'static str, err: impl fmt::Display) -> Self {
        StoreError::Backend {
            backend,
            message: err.to_string(),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Pluggable usage, cache and metrics storage.
///
/// Missing counters read as `0.0`; expired cache entries read as `""`.
/// `increment_usage` appends a history point and advances the counter as one
/// unit: on failure neither is observable.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Backend name for logs and metric labels.
    fn backend(&self) -> &'static str;

    async fn get_usage(&self, provider: &str, key: &str, metric: UsageMetric) -> StoreResult<f64>;

    async fn set_usage(
        &self,
        provider: &str,
        key: &str,
        metric: UsageMetric,
        value: f64,
    ) -> StoreResult<()>;

    async fn increment_usage(
        &self,
        provider: &str,
        key: &str,
        metric: UsageMetric,
        delta: f64,
    ) -> StoreResult<()>;

    /// Sum of history points with `timestamp > now - window_secs`. Backends
    /// without history return the lifetime total.
    async fn get_usage_in_window(
        &self,
        provider: &str,
        key: &str,
        metric: UsageMetric,
        window_secs: u64,
    ) -> StoreResult<f64>;

    /// `ttl_secs == 0` means no expiry. Writes always overwrite.
    async fn set_cache(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()>;

    /// Returns `""` on miss or expiry.
    async fn get_cache(&self, key: &str) -> StoreResult<String>;

    async fn store_metric(
        &self,
        name: &str,
        value: f64,
        tags: &HashMap<String, String>,
        timestamp: i64,
    ) -> StoreResult<()>;

    /// Points of `name` with `start <= timestamp <= end` matching every tag in `tag_filter`.
    async fn get_metrics(
        &self,
        name: &str,
        tag_filter: &HashMap<String, String>,
        start: i64,
        end: i64,
    ) -> StoreResult<Vec<MetricPoint>>;
}

pub type SharedStore = Arc<dyn UsageStore>;

/// Current unix time in seconds.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Absolute expiry for a TTL, `None` for no expiry.
pub(crate) fn expiry_for(ttl_secs: u64) -> Option<i64> {
    (ttl_secs > 0).then(|| now_secs().saturating_add(clamp_secs(ttl_secs)))
}

/// Exclusive lower timestamp bound of a window ending now. Saturates for
/// windows longer than the timestamp range.
pub(crate) fn window_start(window_secs: u64) -> i64 {
    now_secs().saturating_sub(clamp_secs(window_secs))
}

fn clamp_secs(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

pub(crate) fn is_expired(expires_at: Option<i64>) -> bool {
    expires_at.is_some_and(|at| now_secs() >= at)
}

/// Connect the configured runtime backend.
pub async fn connect_store(config: &RuntimeStorage) -> StoreResult<SharedStore> {
    let store: SharedStore = match config.store_type {
        StoreType::Memory => Arc::new(MemoryStore::new()),
        StoreType::Redis => Arc::new(RedisStore::connect(config).await?),
        StoreType::Sql => Arc::new(SqlStore::connect(config).await?),
        StoreType::Influxdb => Arc::new(InfluxStore::connect(config).await?),
        StoreType::Http => Arc::new(HttpStore::new(config)?),
        #[cfg(feature = "store-mongodb")]
        StoreType::Mongodb => Arc::new(mongo::MongoStore::connect(config).await?),
        #[cfg(feature = "store-dynamodb")]
        StoreType::Dynamodb => Arc::new(dynamo::DynamoStore::connect(config).await?),
        #[allow(unreachable_patterns)]
        other => {
            return Err(StoreError::Config(format!(
                "store backend '{}' is not compiled into this build",
                other
            )))
        }
    };

    tracing::info!(backend = store.backend(), "Usage store connected");
    Ok(store)
}
