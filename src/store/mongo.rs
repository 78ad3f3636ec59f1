//! MongoDB usage store.
//!
//! Increments run in a multi-document transaction (history insert plus an
//! upserted `$inc`), which requires a replica set or sharded cluster.

use super::{expiry_for, now_secs, MetricPoint, StoreError, StoreResult, UsageMetric, UsageStore};
use crate::core::config::RuntimeStorage;
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::{Client, Collection};
use std::collections::HashMap;

const BACKEND: &str = "mongodb";
const DEFAULT_DATABASE: &str = "llm_gateway";

pub struct MongoStore {
    client: Client,
    usage: Collection<Document>,
    history: Collection<Document>,
    cache: Collection<Document>,
    metrics: Collection<Document>,
}

fn mongo_err(err: mongodb::error::Error) -> StoreError {
    StoreError::backend(BACKEND, err)
}

fn counter_filter(provider: &str, key: &str, metric: UsageMetric) -> Document {
    doc! { "provider_id": provider, "key_id": key, "metric": metric.as_str() }
}

fn as_f64(value: Option<&Bson>) -> f64 {
    match value {
        Some(Bson::Double(v)) => *v,
        Some(Bson::Int32(v)) => f64::from(*v),
        Some(Bson::Int64(v)) => *v as f64,
        _ => 0.0,
    }
}

impl MongoStore {
    pub async fn connect(config: &RuntimeStorage) -> StoreResult<Self> {
        let uri = config
            .endpoint()
            .ok_or_else(|| StoreError::Config("mongodb store requires 'url' or 'addr'".into()))?;
        let uri = if uri.starts_with("mongodb://") || uri.starts_with("mongodb+srv://") {
            uri.to_string()
        } else {
            format!("mongodb://{}", uri)
        };

        let client = Client::with_uri_str(&uri)
            .await
            .map_err(|e| StoreError::Connection(format!("mongodb: {}", e)))?;
        let db = client.database(config.database.as_deref().unwrap_or(DEFAULT_DATABASE));
        db.run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| StoreError::Connection(format!("mongodb: {}", e)))?;

        Ok(Self {
            usage: db.collection(&config.table_usage),
            history: db.collection(&config.table_history),
            cache: db.collection(&config.table_cache),
            metrics: db.collection(&config.table_metrics),
            client,
        })
    }
}

#[async_trait]
impl UsageStore for MongoStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn get_usage(&self, provider: &str, key: &str, metric: UsageMetric) -> StoreResult<f64> {
        let found = self
            .usage
            .find_one(counter_filter(provider, key, metric))
            .await
            .map_err(mongo_err)?;
        Ok(found.map(|d| as_f64(d.get("value"))).unwrap_or(0.0))
    }

    async fn set_usage(
        &self,
        provider: &str,
        key: &str,
        metric: UsageMetric,
        value: f64,
    ) -> StoreResult<()> {
        self.usage
            .update_one(
                counter_filter(provider, key, metric),
                doc! { "$set": { "value": value } },
            )
            .upsert(true)
            .await
            .map_err(mongo_err)?;
        Ok(())
    }

    async fn increment_usage(
        &self,
        provider: &str,
        key: &str,
        metric: UsageMetric,
        delta: f64,
    ) -> StoreResult<()> {
        let mut session = self.client.start_session().await.map_err(mongo_err)?;
        session.start_transaction().await.map_err(mongo_err)?;

        let mut entry = counter_filter(provider, key, metric);
        entry.insert("delta", delta);
        entry.insert("ts", now_secs());

        let result = async {
            self.history
                .insert_one(entry)
                .session(&mut session)
                .await?;
            self.usage
                .update_one(
                    counter_filter(provider, key, metric),
                    doc! { "$inc": { "value": delta } },
                )
                .upsert(true)
                .session(&mut session)
                .await?;
            Ok::<_, mongodb::error::Error>(())
        }
        .await;

        match result {
            Ok(()) => session.commit_transaction().await.map_err(mongo_err),
            Err(e) => {
                if let Err(abort) = session.abort_transaction().await {
                    tracing::warn!(error = %abort, "Failed to abort mongodb transaction");
                }
                Err(mongo_err(e))
            }
        }
    }

    async fn get_usage_in_window(
        &self,
        provider: &str,
        key: &str,
        metric: UsageMetric,
        window_secs: u64,
    ) -> StoreResult<f64> {
        let mut filter = counter_filter(provider, key, metric);
        filter.insert("ts", doc! { "$gt": super::window_start(window_secs) });

        let mut cursor = self
            .history
            .aggregate(vec![
                doc! { "$match": filter },
                doc! { "$group": { "_id": Bson::Null, "total": { "$sum": "$delta" } } },
            ])
            .await
            .map_err(mongo_err)?;

        Ok(cursor
            .try_next()
            .await
            .map_err(mongo_err)?
            .map(|d| as_f64(d.get("total")))
            .unwrap_or(0.0))
    }

    async fn set_cache(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()> {
        self.cache
            .replace_one(
                doc! { "_id": key },
                doc! {
                    "_id": key,
                    "value": value,
                    "expires_at": expiry_for(ttl_secs).unwrap_or(0),
                },
            )
            .upsert(true)
            .await
            .map_err(mongo_err)?;
        Ok(())
    }

    async fn get_cache(&self, key: &str) -> StoreResult<String> {
        let Some(entry) = self
            .cache
            .find_one(doc! { "_id": key })
            .await
            .map_err(mongo_err)?
        else {
            return Ok(String::new());
        };

        let expires_at = entry.get_i64("expires_at").unwrap_or(0);
        if expires_at != 0 && expires_at <= now_secs() {
            return Ok(String::new());
        }
        Ok(entry.get_str("value").unwrap_or_default().to_string())
    }

    async fn store_metric(
        &self,
        name: &str,
        value: f64,
        tags: &HashMap<String, String>,
        timestamp: i64,
    ) -> StoreResult<()> {
        let tags: Document = tags
            .iter()
            .map(|(k, v)| (k.clone(), Bson::String(v.clone())))
            .collect();
        self.metrics
            .insert_one(doc! { "name": name, "tags": tags, "value": value, "ts": timestamp })
            .await
            .map_err(mongo_err)?;
        Ok(())
    }

    async fn get_metrics(
        &self,
        name: &str,
        tag_filter: &HashMap<String, String>,
        start: i64,
        end: i64,
    ) -> StoreResult<Vec<MetricPoint>> {
        let docs: Vec<Document> = self
            .metrics
            .find(doc! { "name": name, "ts": { "$gte": start, "$lte": end } })
            .sort(doc! { "ts": 1 })
            .await
            .map_err(mongo_err)?
            .try_collect()
            .await
            .map_err(mongo_err)?;

        Ok(docs
            .into_iter()
            .map(|d| MetricPoint {
                name: name.to_string(),
                tags: d
                    .get_document("tags")
                    .map(|tags| {
                        tags.iter()
                            .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                            .collect()
                    })
                    .unwrap_or_default(),
                value: as_f64(d.get("value")),
                timestamp: d.get_i64("ts").unwrap_or_default(),
            })
            .filter(|p| p.matches(tag_filter))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_bson_coercion() {
        assert_eq!(as_f64(Some(&Bson::Double(1.5))), 1.5);
        assert_eq!(as_f64(Some(&Bson::Int32(3))), 3.0);
        assert_eq!(as_f64(Some(&Bson::Int64(4))), 4.0);
        assert_eq!(as_f64(Some(&Bson::String("x".into()))), 0.0);
        assert_eq!(as_f64(None), 0.0);
    }

    #[test]
    fn test_counter_filter_shape() {
        let filter = counter_filter("openai", "k1", UsageMetric::InputTokens);
        assert_eq!(filter.get_str("metric").unwrap(), "input_tokens");
        assert_eq!(filter.get_str("provider_id").unwrap(), "openai");
    }
}
