//! DynamoDB usage store (single-table design).
//!
//! | item          | pk                              | sk                    |
//! |---------------|---------------------------------|-----------------------|
//! | counter       | `USAGE#{provider}#{key}`        | metric name           |
//! | history point | `HISTORY#{provider}#{key}#{m}`  | timestamp micros + seq|
//! | cache entry   | `CACHE#{key}`                   | `CACHE`               |
//! | metric point  | `METRIC#{name}`                 | timestamp micros + seq|
//!
//! All items live in `table_usage`, keyed by string `pk` and `sk`. Time
//! ordered sort keys are zero-padded so ranges can use `BETWEEN`.

use super::{expiry_for, now_secs, MetricPoint, StoreError, StoreResult, UsageMetric, UsageStore};
use crate::core::config::RuntimeStorage;
use async_trait::async_trait;
use aws_sdk_dynamodb::types::{AttributeValue, Put, TransactWriteItem, Update};
use aws_sdk_dynamodb::Client;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

const BACKEND: &str = "dynamodb";

pub struct DynamoStore {
    client: Client,
    table: String,
    seq: AtomicU64,
}

fn dynamo_err(err: impl std::fmt::Display) -> StoreError {
    StoreError::backend(BACKEND, err)
}

fn s(v: impl Into<String>) -> AttributeValue {
    AttributeValue::S(v.into())
}

fn n(v: impl ToString) -> AttributeValue {
    AttributeValue::N(v.to_string())
}

fn read_n(item: &HashMap<String, AttributeValue>, attr: &str) -> Option<f64> {
    item.get(attr)?.as_n().ok()?.parse().ok()
}

/// Sortable key for a point in time: 20-digit micros plus a 6-digit sequence.
fn time_sort_key(micros: i64, seq: u64) -> String {
    format!("{:020}#{:06}", micros.max(0), seq % 1_000_000)
}

impl DynamoStore {
    pub async fn connect(config: &RuntimeStorage) -> StoreResult<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(endpoint) = config.endpoint() {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;
        let client = Client::new(&sdk_config);

        client
            .describe_table()
            .table_name(&config.table_usage)
            .send()
            .await
            .map_err(|e| StoreError::Connection(format!("dynamodb: {}", e)))?;

        Ok(Self {
            client,
            table: config.table_usage.clone(),
            seq: AtomicU64::new(0),
        })
    }

    fn next_sort_key(&self, secs: i64) -> String {
        time_sort_key(
            secs.saturating_mul(1_000_000),
            self.seq.fetch_add(1, Ordering::Relaxed),
        )
    }

    async fn range_items(
        &self,
        pk: String,
        from_secs: i64,
        to_secs: i64,
    ) -> StoreResult<Vec<HashMap<String, AttributeValue>>> {
        let mut items = Vec::new();
        let mut start_key = None;
        loop {
            let page = self
                .client
                .query()
                .table_name(&self.table)
                .key_condition_expression("pk = :pk AND sk BETWEEN :from AND :to")
                .expression_attribute_values(":pk", s(pk.clone()))
                .expression_attribute_values(":from", s(time_sort_key(from_secs * 1_000_000, 0)))
                .expression_attribute_values(
                    ":to",
                    s(time_sort_key(to_secs.saturating_mul(1_000_000), 999_999)),
                )
                .set_exclusive_start_key(start_key)
                .send()
                .await
                .map_err(dynamo_err)?;

            items.extend(page.items().iter().cloned());
            match page.last_evaluated_key() {
                Some(key) => start_key = Some(key.clone()),
                None => break,
            }
        }
        Ok(items)
    }
}

#[async_trait]
impl UsageStore for DynamoStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn get_usage(&self, provider: &str, key: &str, metric: UsageMetric) -> StoreResult<f64> {
        let out = self
            .client
            .get_item()
            .table_name(&self.table)
            .key("pk", s(format!("USAGE#{}#{}", provider, key)))
            .key("sk", s(metric.as_str()))
            .send()
            .await
            .map_err(dynamo_err)?;
        Ok(out.item().and_then(|item| read_n(item, "value")).unwrap_or(0.0))
    }

    async fn set_usage(
        &self,
        provider: &str,
        key: &str,
        metric: UsageMetric,
        value: f64,
    ) -> StoreResult<()> {
        self.client
            .put_item()
            .table_name(&self.table)
            .item("pk", s(format!("USAGE#{}#{}", provider, key)))
            .item("sk", s(metric.as_str()))
            .item("value", n(value))
            .send()
            .await
            .map_err(dynamo_err)?;
        Ok(())
    }

    async fn increment_usage(
        &self,
        provider: &str,
        key: &str,
        metric: UsageMetric,
        delta: f64,
    ) -> StoreResult<()> {
        let now = now_secs();
        let history = Put::builder()
            .table_name(&self.table)
            .item("pk", s(format!("HISTORY#{}#{}#{}", provider, key, metric)))
            .item("sk", s(self.next_sort_key(now)))
            .item("delta", n(delta))
            .item("ts", n(now))
            .build()
            .map_err(dynamo_err)?;
        let counter = Update::builder()
            .table_name(&self.table)
            .key("pk", s(format!("USAGE#{}#{}", provider, key)))
            .key("sk", s(metric.as_str()))
            .update_expression("ADD #v :d")
            .expression_attribute_names("#v", "value")
            .expression_attribute_values(":d", n(delta))
            .build()
            .map_err(dynamo_err)?;

        self.client
            .transact_write_items()
            .transact_items(TransactWriteItem::builder().put(history).build())
            .transact_items(TransactWriteItem::builder().update(counter).build())
            .send()
            .await
            .map_err(dynamo_err)?;
        Ok(())
    }

    async fn get_usage_in_window(
        &self,
        provider: &str,
        key: &str,
        metric: UsageMetric,
        window_secs: u64,
    ) -> StoreResult<f64> {
        // History keys are inclusive on the lower bound; shift by one second for `ts > now - window`.
        let items = self
            .range_items(
                format!("HISTORY#{}#{}#{}", provider, key, metric),
                super::window_start(window_secs).saturating_add(1),
                now_secs(),
            )
            .await?;
        Ok(items.iter().filter_map(|item| read_n(item, "delta")).sum())
    }

    async fn set_cache(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()> {
        self.client
            .put_item()
            .table_name(&self.table)
            .item("pk", s(format!("CACHE#{}", key)))
            .item("sk", s("CACHE"))
            .item("value", s(value))
            .item("expires_at", n(expiry_for(ttl_secs).unwrap_or(0)))
            .send()
            .await
            .map_err(dynamo_err)?;
        Ok(())
    }

    async fn get_cache(&self, key: &str) -> StoreResult<String> {
        let out = self
            .client
            .get_item()
            .table_name(&self.table)
            .key("pk", s(format!("CACHE#{}", key)))
            .key("sk", s("CACHE"))
            .consistent_read(true)
            .send()
            .await
            .map_err(dynamo_err)?;

        let Some(item) = out.item() else {
            return Ok(String::new());
        };
        let expires_at = read_n(item, "expires_at").unwrap_or(0.0) as i64;
        if expires_at != 0 && expires_at <= now_secs() {
            return Ok(String::new());
        }
        Ok(item
            .get("value")
            .and_then(|v| v.as_s().ok())
            .cloned()
            .unwrap_or_default())
    }

    async fn store_metric(
        &self,
        name: &str,
        value: f64,
        tags: &HashMap<String, String>,
        timestamp: i64,
    ) -> StoreResult<()> {
        let tags = tags
            .iter()
            .map(|(k, v)| (k.clone(), s(v.clone())))
            .collect::<HashMap<_, _>>();
        self.client
            .put_item()
            .table_name(&self.table)
            .item("pk", s(format!("METRIC#{}", name)))
            .item("sk", s(self.next_sort_key(timestamp)))
            .item("value", n(value))
            .item("ts", n(timestamp))
            .item("tags", AttributeValue::M(tags))
            .send()
            .await
            .map_err(dynamo_err)?;
        Ok(())
    }

    async fn get_metrics(
        &self,
        name: &str,
        tag_filter: &HashMap<String, String>,
        start: i64,
        end: i64,
    ) -> StoreResult<Vec<MetricPoint>> {
        let items = self
            .range_items(format!("METRIC#{}", name), start, end)
            .await?;

        Ok(items
            .iter()
            .map(|item| MetricPoint {
                name: name.to_string(),
                tags: item
                    .get("tags")
                    .and_then(|t| t.as_m().ok())
                    .map(|m| {
                        m.iter()
                            .filter_map(|(k, v)| v.as_s().ok().map(|v| (k.clone(), v.clone())))
                            .collect()
                    })
                    .unwrap_or_default(),
                value: read_n(item, "value").unwrap_or(0.0),
                timestamp: read_n(item, "ts").unwrap_or(0.0) as i64,
            })
            .filter(|p| p.matches(tag_filter))
            .collect())
    }
}
